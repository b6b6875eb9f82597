//! 推理节点: 消费帧、执行模型、发布结构化结果
//! Model node: consumes frames, runs the model, publishes results
//!
//! 启动时向上游采集节点挂载自己的邮箱; 工作线程取帧在临界区外阻塞,
//! 预处理/推理/跟踪/计数在临界区内完成, 与并发的 `config` 控制互相
//! 串行化。单帧失败发一条 error 事件后继续, 不拖垮整条流水线。

use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::frame::SharedFrame;
use super::msgbox::MessageBox;
use super::worker::Worker;
use super::{FrameBox, Node, NodeHandle, NodePhase, ResolvedDeps};
use crate::config::{opt_bool, opt_f32, opt_i16_array, opt_str, opt_string_array, opt_u32};
use crate::detection::{Tracker, ZoneCounter};
use crate::error::NodeError;
use crate::models::{self, Model, ModelOption};
use crate::server::{reply, EventSinkRef, MSG_TYPE_EVT};

/// 邮箱深度: 推理落后时最多积压这么多帧, 更旧的被挤掉
const MAILBOX_DEPTH: usize = 30;
/// 取帧超时, 同时是停止标志的检查周期
const FETCH_TIMEOUT: Duration = Duration::from_secs(2);
/// debug 事件附带的原始帧 JPEG 质量
const DEBUG_QUALITY: u8 = 90;

/// 工作线程与控制面共享的状态 (经 `Worker::enter` 互斥)
struct ModelShared {
    model: Box<dyn Model>,
    tracker: Tracker,
    counter: ZoneCounter,
    /// 在 invoke 事件里附带原始帧
    debug: bool,
    /// 输出轨迹 id
    trace: bool,
    /// 输出分界线计数
    counting: bool,
    /// 已处理的帧数
    count: u64,
}

pub struct ModelNode {
    id: String,
    phase: NodePhase,
    events: EventSinkRef,
    mailbox: Option<FrameBox>,
    /// 已挂载的上游: (邮箱挂载 id, 生产者句柄), 停止时逐个卸载
    attached: Vec<(u64, NodeHandle)>,
    worker: Option<Worker<ModelShared>>,
}

impl ModelNode {
    pub fn boxed(id: String, events: EventSinkRef) -> Box<dyn Node> {
        Box::new(Self {
            id,
            phase: NodePhase::Uninitialized,
            events,
            mailbox: None,
            attached: Vec::new(),
            worker: None,
        })
    }

    /// 处理一帧并组装 invoke 事件载荷; 临界区内调用
    fn process(shared: &mut ModelShared, frame: &SharedFrame) -> Result<Value, NodeError> {
        shared.count += 1;
        let img = &frame.image;
        let (iw, ih) = (img.width as f32, img.height as f32);

        let started = Instant::now();
        let (side, _) = shared.model.input_shape();
        let tensor = models::letterbox(img, side)?;
        let pre = started.elapsed().as_secs_f32() * 1000.0;

        shared.model.run(tensor.view())?;
        let mut perf = shared.model.performance();
        perf.preprocess += pre;

        // 结果从 letterbox 坐标系映回原始帧的归一化坐标
        let sidef = side as f32;
        let scale = (sidef / iw).min(sidef / ih);
        let nw = ((iw * scale) as u32).max(1) as f32;
        let nh = ((ih * scale) as u32).max(1) as f32;
        let left = ((sidef - nw) / 2.0).floor();
        let top = ((sidef - nh) / 2.0).floor();
        let results: Vec<_> = shared
            .model
            .results()
            .iter()
            .map(|d| {
                crate::detection::Detection::new(
                    (d.x * sidef - left) / nw,
                    (d.y * sidef - top) / nh,
                    d.w * sidef / nw,
                    d.h * sidef / nh,
                    d.score,
                    d.target,
                )
            })
            .collect();

        // 像素坐标的中心点框, 置信度转整数百分比
        let boxes: Vec<Value> = results
            .iter()
            .map(|d| {
                json!([
                    (d.x * iw) as i64,
                    (d.y * ih) as i64,
                    (d.w * iw) as i64,
                    (d.h * ih) as i64,
                    (d.score * 100.0) as i64,
                    d.target,
                ])
            })
            .collect();

        let mut data = json!({
            "count": shared.count,
            "resolution": [img.width, img.height],
            "boxes": boxes,
            "perf": [perf.preprocess, perf.inference, perf.postprocess],
            "labels": shared.model.labels(),
        });

        if shared.trace || shared.counting {
            let tracks = shared.tracker.update(&results);
            if shared.trace {
                data["tracks"] = json!(tracks);
            }
            if shared.counting {
                if results.is_empty() {
                    // 空帧推进计数器时钟, 绝不计数
                    shared.counter.update(None, 0.0, 0.0);
                } else {
                    for (det, id) in results.iter().zip(&tracks) {
                        shared.counter.update(Some(*id), det.x * 100.0, det.y * 100.0);
                    }
                }
                data["counts"] = json!(shared.counter.get());
                data["lines"] = json!(shared.counter.splitter());
            }
        }

        if shared.debug {
            data["image"] = json!(img.to_jpeg_base64(None, DEBUG_QUALITY)?);
        }

        Ok(data)
    }

    /// 应用一批运行期参数; 临界区内调用
    fn reconfigure(shared: &mut ModelShared, data: &Value) -> Result<(), NodeError> {
        if let Some(v) = opt_f32(data, "tscore") {
            shared.model.set_option(ModelOption::ScoreThreshold, v);
        }
        if let Some(v) = opt_f32(data, "tiou") {
            shared.model.set_option(ModelOption::NmsThreshold, v);
        }
        if let Some(v) = opt_f32(data, "topk") {
            shared.model.set_option(ModelOption::TopK, v);
        }
        if let Some(debug) = data.get("debug").and_then(Value::as_bool) {
            shared.debug = debug;
        }
        if let Some(trace) = data.get("trace").and_then(Value::as_bool) {
            if shared.trace != trace {
                // 开关切换后轨迹 id 从零重新铸造
                shared.tracker.clear();
            }
            shared.trace = trace;
        }
        if let Some(counting) = data.get("counting").and_then(Value::as_bool) {
            if shared.counting != counting {
                shared.counter.clear();
            }
            shared.counting = counting;
        }
        if let Some(points) = opt_i16_array(data, "splitter") {
            shared.counter.set_splitter(&points)?;
        }
        Ok(())
    }
}

impl Node for ModelNode {
    fn node_type(&self) -> &'static str {
        "model"
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn phase(&self) -> NodePhase {
        self.phase
    }

    fn on_create(&mut self, config: &Value) -> Result<Value, NodeError> {
        if self.phase != NodePhase::Uninitialized {
            return Err(NodeError::ConfigInvalid(format!(
                "model '{}' already created",
                self.id
            )));
        }

        let uri = opt_str(config, "uri").unwrap_or("builtin:blob").to_string();
        let labels = opt_string_array(config, "labels");
        let mut model = models::load(&uri, &labels)?;

        if let Some(v) = opt_f32(config, "tscore") {
            model.set_option(ModelOption::ScoreThreshold, v);
        }
        if let Some(v) = opt_f32(config, "tiou") {
            model.set_option(ModelOption::NmsThreshold, v);
        }
        let topk = opt_u32(config, "topk", 0);
        if topk > 0 {
            model.set_option(ModelOption::TopK, topk as f32);
        }

        let mut counter = ZoneCounter::new();
        if let Some(points) = opt_i16_array(config, "splitter") {
            counter.set_splitter(&points)?;
        }

        let (in_w, in_h) = model.input_shape();
        let data = json!({
            "model": model.name(),
            "input": [in_w, in_h],
            "labels": model.labels(),
        });

        self.mailbox = Some(MessageBox::new(MAILBOX_DEPTH));
        self.worker = Some(Worker::new(
            format!("model#{}", self.id),
            ModelShared {
                model,
                tracker: Tracker::default(),
                counter,
                debug: opt_bool(config, "debug", false),
                trace: opt_bool(config, "trace", false),
                counting: opt_bool(config, "counting", false),
                count: 0,
            },
        ));
        self.phase = NodePhase::Created;
        debug!(id = %self.id, uri = %uri, "model created");
        Ok(data)
    }

    fn on_start(&mut self, deps: &ResolvedDeps) -> Result<(), NodeError> {
        if self.phase == NodePhase::Started {
            return Ok(());
        }
        let worker = self.worker.as_mut().ok_or_else(|| {
            NodeError::ConfigInvalid(format!("model '{}' not created", self.id))
        })?;
        let mailbox = self.mailbox.clone().ok_or_else(|| {
            NodeError::ConfigInvalid(format!("model '{}' not created", self.id))
        })?;

        let (producer_id, producer) = deps
            .find_type("camera")
            .ok_or_else(|| NodeError::DependencyMissing("camera".into()))?;

        let id = self.id.clone();
        let events = self.events.clone();
        let inbox = mailbox.clone();
        worker.start(move |scope| {
            while scope.is_running() {
                // 取帧在临界区外阻塞, 控制面不受等待影响
                let Some(frame) = inbox.fetch(FETCH_TIMEOUT) else {
                    continue;
                };
                match scope.enter(|shared| Self::process(shared, &frame)) {
                    Ok(data) => events.response(&id, reply(MSG_TYPE_EVT, "invoke", 0, data)),
                    Err(e) => {
                        warn!(id = %id, error = %e, "invoke failed");
                        events.response(
                            &id,
                            reply(MSG_TYPE_EVT, "error", e.code(), json!(e.to_string())),
                        );
                    }
                }
            }
        })?;

        if let Err(e) = producer.lock().unwrap().attach(mailbox.clone()) {
            worker.stop();
            return Err(e);
        }
        debug!(id = %self.id, producer = producer_id, "model attached to producer");
        self.attached.push((mailbox.id(), producer.clone()));
        self.phase = NodePhase::Started;
        Ok(())
    }

    fn on_control(&mut self, command: &str, data: &Value) -> Result<Value, NodeError> {
        let worker = self.worker.as_ref().ok_or_else(|| {
            NodeError::ConfigInvalid(format!("model '{}' not created", self.id))
        })?;
        match command {
            "config" => {
                worker.enter(|shared| Self::reconfigure(shared, data))?;
                Ok(data.clone())
            }
            other => Err(NodeError::Unsupported(format!("model command '{other}'"))),
        }
    }

    fn on_stop(&mut self) -> Result<(), NodeError> {
        if self.phase != NodePhase::Started {
            return Ok(());
        }
        if let Some(worker) = self.worker.as_mut() {
            worker.stop();
        }
        for (sink_id, producer) in self.attached.drain(..) {
            if let Err(e) = producer.lock().unwrap().detach(sink_id) {
                warn!(id = %self.id, error = %e, "detach failed");
            }
        }
        // 排空停机期间滞留的帧引用
        if let Some(mailbox) = &self.mailbox {
            while mailbox.try_fetch().is_some() {}
        }
        self.phase = NodePhase::Stopped;
        Ok(())
    }

    fn on_destroy(&mut self) -> Result<(), NodeError> {
        if self.phase == NodePhase::Destroyed {
            return Ok(());
        }
        self.on_stop()?;
        self.worker = None;
        self.mailbox = None;
        self.phase = NodePhase::Destroyed;
        Ok(())
    }
}
