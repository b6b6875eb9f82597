//! 节点运行时: 生命周期、依赖图、缓冲传递
//! Node runtime: lifecycle, dependency graph, buffer passing
//!
//! 节点是独立线程化的流水线阶段, 控制面自上而下 (外部 → 图 → 节点),
//! 数据面自前向后 (采集 → 邮箱 → 消费者)。每个节点的生命周期调用由
//! 图中包裹它的互斥锁线性化。

pub mod camera;
pub mod factory;
pub mod frame;
pub mod graph;
pub mod model;
pub mod msgbox;
pub mod worker;

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::NodeError;
use frame::SharedFrame;
use msgbox::MessageBox;

/// 帧邮箱: 生产者节点与消费者节点间的挂载单元
pub type FrameBox = MessageBox<SharedFrame>;

/// 图持有的节点句柄; 互斥锁把该节点的生命周期调用串行化
pub type NodeHandle = Arc<Mutex<Box<dyn Node>>>;

/// 节点生命周期阶段
///
/// `Created ↔ Stopped` 可以反复往返 (节点可多次启停而无需重建),
/// `Destroyed` 是终态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodePhase {
    Uninitialized,
    Created,
    Started,
    Stopped,
    Destroyed,
}

impl NodePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodePhase::Uninitialized => "uninitialized",
            NodePhase::Created => "created",
            NodePhase::Started => "started",
            NodePhase::Stopped => "stopped",
            NodePhase::Destroyed => "destroyed",
        }
    }
}

/// `start()` 时由图解析好的上游依赖集合
#[derive(Default)]
pub struct ResolvedDeps {
    entries: Vec<(String, String, NodeHandle)>,
}

impl ResolvedDeps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: String, node_type: String, handle: NodeHandle) {
        self.entries.push((id, node_type, handle));
    }

    /// 按类型查找第一个依赖
    pub fn find_type(&self, node_type: &str) -> Option<(&str, &NodeHandle)> {
        self.entries
            .iter()
            .find(|(_, ty, _)| ty == node_type)
            .map(|(id, _, handle)| (id.as_str(), handle))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 流水线节点的统一生命周期接口
///
/// 各方法由图在持有节点互斥锁的情况下调用, 因此实现内部无需再加锁
/// 来串行化生命周期; 与自身工作线程共享的状态经由 `Worker::enter`
/// 保护。
pub trait Node: Send {
    fn node_type(&self) -> &'static str;

    fn id(&self) -> &str;

    fn phase(&self) -> NodePhase;

    /// 校验配置并获取节点内部资源。
    /// 中途失败必须先释放本次调用已获取的一切资源再返回错误,
    /// 状态保持 `Uninitialized`。
    fn on_create(&mut self, config: &Value) -> Result<Value, NodeError>;

    /// 解析依赖、挂载上游、放行工作线程。已启动时幂等。
    fn on_start(&mut self, deps: &ResolvedDeps) -> Result<(), NodeError>;

    /// 运行期参数调整, 不改变生命周期阶段
    fn on_control(&mut self, command: &str, data: &Value) -> Result<Value, NodeError>;

    /// 通知工作线程退出并 join, 从上游卸载。未启动时幂等。
    fn on_stop(&mut self) -> Result<(), NodeError>;

    /// 停止并释放全部内部资源, 进入终态。幂等。
    fn on_destroy(&mut self) -> Result<(), NodeError>;

    /// 生产者侧: 把一个消费者邮箱加入扇出集合
    fn attach(&mut self, _sink: FrameBox) -> Result<(), NodeError> {
        Err(NodeError::Unsupported("attach".into()))
    }

    /// 生产者侧: 按挂载 id 移除邮箱
    fn detach(&mut self, _sink_id: u64) -> Result<(), NodeError> {
        Err(NodeError::Unsupported("detach".into()))
    }
}
