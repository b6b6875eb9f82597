//! 控制分发与事件出口
//! Control dispatch and outbound event sink
//!
//! 传输层协作者 (broker 连接、主题路由、编码) 在本模块之外; 这里只
//! 定义它与图之间的契约: 进来的是 `(节点 id, 命令, 载荷)`, 出去的是
//! `(节点 id, 应答/事件记录)`。应答与事件共用
//! `{type, name, code, data}` 的记录形状。

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::NodeError;
use crate::node::graph::NodeGraph;

/// 应答记录 (对一条控制请求的直接回应)
pub const MSG_TYPE_RESP: &str = "resp";
/// 事件记录 (节点主动上报: invoke/sample/error)
pub const MSG_TYPE_EVT: &str = "evt";

/// 组装一条应答/事件记录
pub fn reply(kind: &str, name: &str, code: u32, data: Value) -> Value {
    json!({ "type": kind, "name": name, "code": code, "data": data })
}

/// 出站事件接收端; 由传输层实现, 节点与分发器只管投递
pub trait EventSink: Send + Sync {
    fn response(&self, node_id: &str, payload: Value);
}

pub type EventSinkRef = Arc<dyn EventSink>;

/// 入站控制请求
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    /// 目标节点 id
    pub id: String,
    /// create/destroy/start/stop 或节点自定义控制命令
    pub command: String,
    #[serde(default)]
    pub data: Value,
}

// ========== 内建事件出口 ==========

/// 把事件写入进程内通道, 用于嵌入与测试
pub struct ChannelSink {
    tx: Sender<(String, Value)>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, Receiver<(String, Value)>) {
        let (tx, rx) = unbounded();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventSink for ChannelSink {
    fn response(&self, node_id: &str, payload: Value) {
        let _ = self.tx.send((node_id.to_string(), payload));
    }
}

/// 把事件作为 JSON 行写到标准输出 (与标准输入控制通道配对)
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn response(&self, node_id: &str, payload: Value) {
        let record = json!({ "id": node_id, "payload": payload });
        println!("{record}");
    }
}

// ========== 控制分发 ==========

/// 把控制请求映射到图上的生命周期/控制调用
pub struct NodeServer {
    graph: Arc<NodeGraph>,
    sink: EventSinkRef,
}

impl NodeServer {
    pub fn new(graph: Arc<NodeGraph>, sink: EventSinkRef) -> Self {
        Self { graph, sink }
    }

    pub fn graph(&self) -> &Arc<NodeGraph> {
        &self.graph
    }

    /// 处理一条控制请求并发出应答。
    /// 错误永远不被吞掉: 失败以非零 code 回给请求方。
    pub fn dispatch(&self, req: &Request) {
        debug!(id = %req.id, command = %req.command, "control request");
        let result: Result<Value, NodeError> = match req.command.as_str() {
            "create" => self.create(req),
            "destroy" => self.graph.destroy(&req.id).map(|_| Value::Null),
            "start" => self.graph.start(&req.id).map(|_| Value::Null),
            "stop" => self.graph.stop(&req.id).map(|_| Value::Null),
            command => self.graph.control(&req.id, command, &req.data),
        };
        match result {
            Ok(data) => self
                .sink
                .response(&req.id, reply(MSG_TYPE_RESP, &req.command, 0, data)),
            Err(e) => {
                warn!(id = %req.id, command = %req.command, error = %e, "control request failed");
                self.sink.response(
                    &req.id,
                    reply(MSG_TYPE_RESP, &req.command, e.code(), json!(e.to_string())),
                );
            }
        }
    }

    fn create(&self, req: &Request) -> Result<Value, NodeError> {
        let node_type = req
            .data
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::ConfigInvalid("create requires a node type".into()))?;
        let config = req.data.get("config").cloned().unwrap_or(Value::Null);
        let deps: Vec<String> = req
            .data
            .get("dependencies")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        self.graph.create(&req.id, node_type, &config, &deps)
    }

    /// 把启动配置重放为 create(+start) 请求序列
    pub fn bootstrap(&self, cfg: &PipelineConfig) {
        for spec in &cfg.nodes {
            self.dispatch(&Request {
                id: spec.id.clone(),
                command: "create".into(),
                data: json!({
                    "type": spec.node_type,
                    "config": spec.config,
                    "dependencies": spec.dependencies,
                }),
            });
        }
        // 全部创建完成后再启动, 依赖此时必然可解析
        for spec in &cfg.nodes {
            if spec.autostart {
                self.dispatch(&Request {
                    id: spec.id.clone(),
                    command: "start".into(),
                    data: Value::Null,
                });
            }
        }
    }

    /// 消费控制通道直到发送端全部关闭
    pub fn run(&self, rx: Receiver<Request>) {
        for req in rx.iter() {
            self.dispatch(&req);
        }
    }
}
