//! 采集节点: 从采集源读帧并扇出给挂载的消费者
//! Camera node: reads frames from a capture source and fans them out
//!
//! 工作线程每拍一次: 读一帧, 包成共享引用, 逐个投递到挂载的邮箱。
//! 投递是丢弃最旧语义, 慢消费者永远拖不慢采集节拍。预览编码在临界
//! 区之外进行, 控制面不会被 JPEG 编码挡住。

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::frame::{RawImage, SharedFrame, VideoFrame};
use super::worker::Worker;
use super::{FrameBox, Node, NodePhase, ResolvedDeps};
use crate::config::{opt_bool, opt_str, opt_u32};
use crate::error::NodeError;
use crate::server::{reply, EventSinkRef, MSG_TYPE_EVT};
use crate::source::{self, FrameSource, SourceInfo};

/// 预览缩略图尺寸与质量
const PREVIEW_SIZE: (u32, u32) = (320, 240);
const PREVIEW_QUALITY: u8 = 50;

/// 工作线程与控制面共享的状态 (经 `Worker::enter` 互斥)
struct CameraShared {
    source: Box<dyn FrameSource>,
    sinks: Vec<FrameBox>,
    preview: bool,
    /// 已发布的帧数
    count: u64,
}

pub struct CameraNode {
    id: String,
    phase: NodePhase,
    events: EventSinkRef,
    info: SourceInfo,
    worker: Option<Worker<CameraShared>>,
}

impl CameraNode {
    pub fn boxed(id: String, events: EventSinkRef) -> Box<dyn Node> {
        Box::new(Self {
            id,
            phase: NodePhase::Uninitialized,
            events,
            info: SourceInfo {
                width: 0,
                height: 0,
                fps: 0,
            },
            worker: None,
        })
    }

    /// 读一帧并扇出; 临界区内完成, 返回需要预览时的帧引用
    fn capture(shared: &mut CameraShared) -> Result<Option<(SharedFrame, u64)>, NodeError> {
        let image = shared.source.read()?;
        shared.count += 1;
        let frame: SharedFrame = std::sync::Arc::new(VideoFrame::new(image, shared.count));
        for sink in &shared.sinks {
            sink.post(frame.clone());
        }
        if shared.preview {
            Ok(Some((frame, shared.count)))
        } else {
            Ok(None)
        }
    }

    fn encode_preview(image: &RawImage) -> Result<String, NodeError> {
        image.to_jpeg_base64(Some(PREVIEW_SIZE), PREVIEW_QUALITY)
    }
}

impl Node for CameraNode {
    fn node_type(&self) -> &'static str {
        "camera"
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
                "camera '{}' already created",
                self.id
            )));
        }

        let uri = opt_str(config, "source").unwrap_or("pattern:square").to_string();
        let info = SourceInfo {
            width: opt_u32(config, "width", 640),
            height: opt_u32(config, "height", 480),
            fps: opt_u32(config, "fps", 30),
        };
        let preview = opt_bool(config, "preview", false);

        let source = source::open(&uri, info)?;
        self.info = source.info();
        self.worker = Some(Worker::new(
            format!("camera#{}", self.id),
            CameraShared {
                source,
                sinks: Vec::new(),
                preview,
                count: 0,
            },
        ));
        self.phase = NodePhase::Created;
        debug!(id = %self.id, uri = %uri, width = self.info.width,
               height = self.info.height, fps = self.info.fps, "camera created");
        Ok(json!({
            "width": self.info.width,
            "height": self.info.height,
            "fps": self.info.fps,
        }))
    }

    fn on_start(&mut self, _deps: &ResolvedDeps) -> Result<(), NodeError> {
        if self.phase == NodePhase::Started {
            return Ok(());
        }
        let worker = self.worker.as_mut().ok_or_else(|| {
            NodeError::ConfigInvalid(format!("camera '{}' not created", self.id))
        })?;

        let id = self.id.clone();
        let events = self.events.clone();
        worker.start(move |scope| {
            while scope.is_running() {
                match scope.enter(Self::capture) {
                    Ok(Some((frame, count))) => match Self::encode_preview(&frame.image) {
                        Ok(image) => events.response(
                            &id,
                            reply(
                                MSG_TYPE_EVT,
                                "sample",
                                0,
                                json!({ "count": count, "image": image }),
                            ),
                        ),
                        Err(e) => warn!(id = %id, error = %e, "preview encode failed"),
                    },
                    Ok(None) => {}
                    Err(e) => {
                        warn!(id = %id, error = %e, "capture failed");
                        events.response(
                            &id,
                            reply(MSG_TYPE_EVT, "error", e.code(), json!(e.to_string())),
                        );
                        // 源端故障, 退避后重试
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
        })?;
        self.phase = NodePhase::Started;
        Ok(())
    }

    fn on_control(&mut self, command: &str, data: &Value) -> Result<Value, NodeError> {
        let worker = self.worker.as_ref().ok_or_else(|| {
            NodeError::ConfigInvalid(format!("camera '{}' not created", self.id))
        })?;
        match command {
            "config" => {
                if let Some(preview) = data.get("preview").and_then(Value::as_bool) {
                    worker.enter(|shared| shared.preview = preview);
                }
                Ok(data.clone())
            }
            other => Err(NodeError::Unsupported(format!(
                "camera command '{other}'"
            ))),
        }
    }

    fn on_stop(&mut self) -> Result<(), NodeError> {
        if self.phase != NodePhase::Started {
            return Ok(());
        }
        if let Some(worker) = self.worker.as_mut() {
            // 采集源保持打开, 再次 start 从当前位置继续
            worker.stop();
        }
        self.phase = NodePhase::Stopped;
        Ok(())
    }

    fn on_destroy(&mut self) -> Result<(), NodeError> {
        if self.phase == NodePhase::Destroyed {
            return Ok(());
        }
        self.on_stop()?;
        // Worker 落下时连带释放采集源与全部挂载邮箱的发送端
        self.worker = None;
        self.phase = NodePhase::Destroyed;
        Ok(())
    }

    /// 挂载一个消费者邮箱; 同一邮箱重复挂载是幂等的
    fn attach(&mut self, sink: FrameBox) -> Result<(), NodeError> {
        let worker = self.worker.as_ref().ok_or_else(|| {
            NodeError::ConfigInvalid(format!("camera '{}' not created", self.id))
        })?;
        worker.enter(|shared| {
            if !shared.sinks.iter().any(|s| s.id() == sink.id()) {
                shared.sinks.push(sink);
            }
        });
        Ok(())
    }

    fn detach(&mut self, sink_id: u64) -> Result<(), NodeError> {
        let worker = self.worker.as_ref().ok_or_else(|| {
            NodeError::ConfigInvalid(format!("camera '{}' not created", self.id))
        })?;
        worker.enter(|shared| shared.sinks.retain(|s| s.id() != sink_id));
        Ok(())
    }
}
