//! sentinel-node: 端侧传感器→推理流水线节点运行时
//! On-device sensor-to-inference node runtime
//!
//! 运行时把流水线表达为一张节点图: 采集节点生产共享帧引用, 经有界
//! 邮箱扇出给推理节点; 推理节点跑模型、跟踪目标、统计分界线穿越,
//! 把结构化结果发往事件出口。控制面是统一的请求/应答协议, 节点的
//! 创建/启动/停止/销毁与运行期调参都经由它。
//!
//! 嵌入用法:
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use sentinel_node::{default_factory, ChannelSink, NodeGraph};
//!
//! let (sink, events) = ChannelSink::new();
//! let graph = Arc::new(NodeGraph::new(default_factory(), sink));
//! graph.create("cam0", "camera", &json!({"source": "pattern:square"}), &[]).unwrap();
//! graph.create("det0", "model", &json!({"uri": "builtin:blob"}), &["cam0".into()]).unwrap();
//! graph.start("cam0").unwrap();
//! graph.start("det0").unwrap();
//! let (node_id, payload) = events.recv().unwrap();
//! println!("{node_id}: {payload}");
//! graph.teardown();
//! ```

pub mod config;
pub mod detection;
pub mod error;
pub mod models;
pub mod node;
pub mod server;
pub mod source;

pub use config::{load_pipeline, Args, PipelineConfig};
pub use error::NodeError;
pub use node::factory::{default_factory, NodeFactory};
pub use node::frame::{RawImage, SharedFrame, VideoFrame};
pub use node::graph::NodeGraph;
pub use node::{FrameBox, Node, NodeHandle, NodePhase};
pub use server::{ChannelSink, EventSink, EventSinkRef, NodeServer, Request, StdoutSink};
