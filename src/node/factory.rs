//! 节点类型工厂
//! Node type factory
//!
//! 类型名 → 构造函数的显式注册表, 在启动时一次性建好, 由图查询。
//! 不依赖任何链接期静态初始化。

use std::collections::HashMap;

use super::camera::CameraNode;
use super::model::ModelNode;
use super::Node;
use crate::error::NodeError;
use crate::server::EventSinkRef;

/// 节点构造函数: (实例 id, 事件出口) → 节点
pub type NodeCtor = fn(String, EventSinkRef) -> Box<dyn Node>;

struct Entry {
    ctor: NodeCtor,
    singleton: bool,
}

#[derive(Default)]
pub struct NodeFactory {
    entries: HashMap<&'static str, Entry>,
}

impl NodeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一种节点类型; `singleton` 类型全图至多一个实例
    pub fn register(&mut self, node_type: &'static str, singleton: bool, ctor: NodeCtor) {
        self.entries.insert(node_type, Entry { ctor, singleton });
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.entries.contains_key(node_type)
    }

    pub fn is_singleton(&self, node_type: &str) -> bool {
        self.entries
            .get(node_type)
            .map(|e| e.singleton)
            .unwrap_or(false)
    }

    pub fn build(
        &self,
        node_type: &str,
        id: String,
        events: EventSinkRef,
    ) -> Result<Box<dyn Node>, NodeError> {
        let entry = self
            .entries
            .get(node_type)
            .ok_or_else(|| NodeError::Unsupported(format!("unknown node type '{node_type}'")))?;
        Ok((entry.ctor)(id, events))
    }
}

/// 内建节点类型表
pub fn default_factory() -> NodeFactory {
    let mut factory = NodeFactory::new();
    factory.register("camera", false, CameraNode::boxed);
    // 推理节点独占加速器, 按单例注册
    factory.register("model", true, ModelNode::boxed);
    factory
}
