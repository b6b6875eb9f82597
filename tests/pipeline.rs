//! 端到端流水线测试: 图样采集 → 斑点检测 → 跟踪 → 计数
//! End-to-end pipeline: pattern capture, blob detection, tracking, counting

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use serde_json::{json, Value};

use sentinel_node::{
    default_factory, ChannelSink, NodeGraph, NodePhase, NodeServer, PipelineConfig, Request,
};

fn graph_with_events() -> (Arc<NodeGraph>, Receiver<(String, Value)>) {
    let (sink, rx) = ChannelSink::new();
    (Arc::new(NodeGraph::new(default_factory(), sink)), rx)
}

fn next_event(rx: &Receiver<(String, Value)>, node: &str, name: &str) -> Value {
    let deadline = Duration::from_secs(10);
    loop {
        let (id, payload) = rx.recv_timeout(deadline).expect("event stream dried up");
        if id == node && payload["name"] == name {
            return payload;
        }
    }
}

#[test]
fn capture_to_counting_end_to_end() {
    let (graph, rx) = graph_with_events();

    graph
        .create(
            "cam0",
            "camera",
            &json!({"source": "pattern:square", "width": 320, "height": 240, "fps": 60}),
            &[],
        )
        .unwrap();
    graph
        .create(
            "det0",
            "model",
            &json!({
                "uri": "builtin:blob",
                "trace": true,
                "counting": true,
                "splitter": [0, 50, 100, 50]
            }),
            &["cam0".into()],
        )
        .unwrap();

    graph.start("cam0").unwrap();
    graph.start("det0").unwrap();
    // 重复 start 是空操作, 不会二次挂载
    graph.start("det0").unwrap();
    assert_eq!(graph.phase("det0").unwrap(), NodePhase::Started);

    // 第一帧: 检测框、轨迹、计数字段齐备
    let first = next_event(&rx, "det0", "invoke");
    assert_eq!(first["type"], "evt");
    assert_eq!(first["code"], 0);
    let data = &first["data"];
    assert_eq!(data["resolution"], json!([320, 240]));
    assert_eq!(data["boxes"].as_array().unwrap().len(), 1);
    assert_eq!(data["lines"], json!([0, 50, 100, 50]));
    let track_id = data["tracks"][0].as_u64().unwrap();

    // 方块连续运动: 身份保持, 帧计数单调
    let mut last_count = data["count"].as_u64().unwrap();
    for _ in 0..20 {
        let payload = next_event(&rx, "det0", "invoke");
        let data = &payload["data"];
        assert_eq!(data["tracks"][0].as_u64().unwrap(), track_id);
        let count = data["count"].as_u64().unwrap();
        assert!(count > last_count);
        last_count = count;
    }

    // 方块垂直往返扫过 y=50%, 等到计数器至少记到一次穿越
    let mut crossings = 0u64;
    for _ in 0..400 {
        let payload = next_event(&rx, "det0", "invoke");
        let counts = payload["data"]["counts"][0].as_array().unwrap();
        crossings = counts[0].as_u64().unwrap() + counts[1].as_u64().unwrap();
        if crossings >= 2 {
            break;
        }
    }
    assert!(crossings >= 2, "square never crossed the line: {crossings}");

    graph.teardown();
    assert!(graph.is_empty());
}

#[test]
fn start_fails_cleanly_without_producer() {
    let (graph, _rx) = graph_with_events();
    graph
        .create("det0", "model", &json!({"uri": "builtin:blob"}), &[])
        .unwrap();
    assert!(graph.start("det0").is_err());
    // 失败的启动不留工作线程, 节点仍可销毁
    graph.destroy("det0").unwrap();
    assert!(graph.is_empty());
}

#[test]
fn bootstrap_replays_config_and_reports_responses() {
    let (sink, rx) = ChannelSink::new();
    let graph = Arc::new(NodeGraph::new(default_factory(), sink.clone()));
    let server = NodeServer::new(graph.clone(), sink);

    let cfg: PipelineConfig = serde_json::from_value(json!({
        "nodes": [
            {"id": "cam0", "type": "camera", "autostart": true,
             "config": {"source": "pattern:square", "width": 64, "height": 64, "fps": 0}},
            {"id": "det0", "type": "model", "dependencies": ["cam0"], "autostart": true,
             "config": {"uri": "builtin:blob"}}
        ]
    }))
    .unwrap();
    server.bootstrap(&cfg);

    // 每个节点各一条 create 应答和一条 start 应答, 全部成功
    let mut oks = 0;
    while oks < 4 {
        let (_, payload) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        if payload["type"] == "resp" {
            assert_eq!(payload["code"], 0, "failed: {payload}");
            oks += 1;
        }
    }
    assert_eq!(graph.phase("cam0").unwrap(), NodePhase::Started);
    assert_eq!(graph.phase("det0").unwrap(), NodePhase::Started);

    // 推理事件随后到达
    next_event(&rx, "det0", "invoke");
    graph.teardown();
}

#[test]
fn dispatch_surfaces_errors_as_nonzero_codes() {
    let (sink, rx) = ChannelSink::new();
    let graph = Arc::new(NodeGraph::new(default_factory(), sink.clone()));
    let server = NodeServer::new(graph, sink);

    server.dispatch(&Request {
        id: "ghost".into(),
        command: "start".into(),
        data: Value::Null,
    });
    let (id, payload) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(id, "ghost");
    assert_eq!(payload["type"], "resp");
    assert_eq!(payload["name"], "start");
    assert_eq!(payload["code"], 1);

    server.dispatch(&Request {
        id: "det0".into(),
        command: "create".into(),
        data: json!({"type": "warp-drive"}),
    });
    let (_, payload) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(payload["code"], 4);
}

#[test]
fn runtime_reconfiguration_toggles_tracking() {
    let (graph, rx) = graph_with_events();
    graph
        .create(
            "cam0",
            "camera",
            &json!({"source": "pattern:square", "width": 64, "height": 64, "fps": 0}),
            &[],
        )
        .unwrap();
    graph
        .create("det0", "model", &json!({"uri": "builtin:blob"}), &["cam0".into()])
        .unwrap();
    graph.start("cam0").unwrap();
    graph.start("det0").unwrap();

    assert!(next_event(&rx, "det0", "invoke")["data"]
        .get("tracks")
        .is_none());

    graph
        .control("det0", "config", &json!({"trace": true}))
        .unwrap();
    let mut traced = false;
    for _ in 0..50 {
        if next_event(&rx, "det0", "invoke")["data"].get("tracks").is_some() {
            traced = true;
            break;
        }
    }
    assert!(traced, "trace toggle never took effect");

    graph.teardown();
}
