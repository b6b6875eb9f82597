//! 节点图: 实例注册表与依赖边
//! Node graph: live instance registry and dependency edges
//!
//! 注册表锁只保护表本身, 与任何单个节点的互斥锁分离; 生命周期调用
//! 从不在持有注册表锁的情况下进行, 避免一个节点的慢操作阻塞无关的
//! 查找。依赖 id 在创建时必须已存在, 因此边集天然无环。

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::factory::NodeFactory;
use super::{NodeHandle, NodePhase, ResolvedDeps};
use crate::error::NodeError;
use crate::server::EventSinkRef;

struct NodeEntry {
    node_type: String,
    deps: Vec<String>,
    handle: NodeHandle,
}

pub struct NodeGraph {
    factory: NodeFactory,
    events: EventSinkRef,
    nodes: Mutex<HashMap<String, NodeEntry>>,
}

impl NodeGraph {
    pub fn new(factory: NodeFactory, events: EventSinkRef) -> Self {
        Self {
            factory,
            events,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// 创建节点并登记依赖边
    ///
    /// 节点构造失败时其 Drop 负责回收已获取的资源, 注册表保持无痕。
    pub fn create(
        &self,
        id: &str,
        node_type: &str,
        config: &Value,
        deps: &[String],
    ) -> Result<Value, NodeError> {
        {
            let nodes = self.nodes.lock().unwrap();
            if nodes.contains_key(id) {
                return Err(NodeError::ConfigInvalid(format!(
                    "node '{id}' already exists"
                )));
            }
            if self.factory.is_singleton(node_type)
                && nodes.values().any(|e| e.node_type == node_type)
            {
                return Err(NodeError::ConfigInvalid(format!(
                    "node type '{node_type}' is singleton"
                )));
            }
            for dep in deps {
                if !nodes.contains_key(dep) {
                    return Err(NodeError::DependencyMissing(dep.clone()));
                }
            }
        }

        let mut node = self.factory.build(node_type, id.to_string(), self.events.clone())?;
        let data = node.on_create(config)?;

        let mut nodes = self.nodes.lock().unwrap();
        // 无锁窗口内的并发创建可能已占用 id 或单例类型: 复检, 输家放弃本实例
        let clash = if nodes.contains_key(id) {
            Some(format!("node '{id}' already exists"))
        } else if self.factory.is_singleton(node_type)
            && nodes.values().any(|e| e.node_type == node_type)
        {
            Some(format!("node type '{node_type}' is singleton"))
        } else {
            None
        };
        if let Some(msg) = clash {
            let _ = node.on_destroy();
            return Err(NodeError::ConfigInvalid(msg));
        }
        nodes.insert(
            id.to_string(),
            NodeEntry {
                node_type: node_type.to_string(),
                deps: deps.to_vec(),
                handle: std::sync::Arc::new(Mutex::new(node)),
            },
        );
        info!(id, node_type, "node created");
        Ok(data)
    }

    fn lookup(&self, id: &str) -> Result<(NodeHandle, Vec<String>), NodeError> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .get(id)
            .map(|e| (e.handle.clone(), e.deps.clone()))
            .ok_or_else(|| NodeError::ConfigInvalid(format!("no such node '{id}'")))
    }

    /// 解析一个节点声明的依赖为句柄集合
    fn resolve_deps(&self, deps: &[String]) -> Result<ResolvedDeps, NodeError> {
        let nodes = self.nodes.lock().unwrap();
        let mut resolved = ResolvedDeps::new();
        for dep in deps {
            let entry = nodes
                .get(dep)
                .ok_or_else(|| NodeError::DependencyMissing(dep.clone()))?;
            resolved.push(dep.clone(), entry.node_type.clone(), entry.handle.clone());
        }
        Ok(resolved)
    }

    pub fn start(&self, id: &str) -> Result<(), NodeError> {
        let (handle, deps) = self.lookup(id)?;
        let resolved = self.resolve_deps(&deps)?;
        let result = handle.lock().unwrap().on_start(&resolved);
        if result.is_ok() {
            info!(id, "node started");
        }
        result
    }

    pub fn stop(&self, id: &str) -> Result<(), NodeError> {
        let (handle, _) = self.lookup(id)?;
        let result = handle.lock().unwrap().on_stop();
        if result.is_ok() {
            info!(id, "node stopped");
        }
        result
    }

    pub fn control(&self, id: &str, command: &str, data: &Value) -> Result<Value, NodeError> {
        let (handle, _) = self.lookup(id)?;
        let result = handle.lock().unwrap().on_control(command, data);
        result
    }

    /// 销毁节点并从注册表移除 (销毁完成后才移除)
    pub fn destroy(&self, id: &str) -> Result<(), NodeError> {
        let (handle, _) = self.lookup(id)?;
        handle.lock().unwrap().on_destroy()?;
        self.nodes.lock().unwrap().remove(id);
        info!(id, "node destroyed");
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().unwrap().is_empty()
    }

    pub fn phase(&self, id: &str) -> Result<NodePhase, NodeError> {
        let (handle, _) = self.lookup(id)?;
        let phase = handle.lock().unwrap().phase();
        Ok(phase)
    }

    /// 按类型列出节点 id
    pub fn find_by_type(&self, node_type: &str) -> Vec<String> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.node_type == node_type)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// 有序拆除全部节点: 先销毁没有下游的节点, 再轮到它的上游,
    /// 保证消费者先于生产者退场。
    pub fn teardown(&self) {
        loop {
            let victim = {
                let nodes = self.nodes.lock().unwrap();
                if nodes.is_empty() {
                    break;
                }
                let leaf = nodes
                    .keys()
                    .find(|id| !nodes.values().any(|e| e.deps.contains(id)))
                    .cloned();
                // 理论上不会没有叶子 (边集无环); 兜底取任意一个
                leaf.or_else(|| nodes.keys().next().cloned())
            };
            if let Some(id) = victim {
                debug!(id = %id, "teardown");
                if let Err(e) = self.destroy(&id) {
                    // 销毁失败的节点也要出表, 否则拆除会反复选中同一个
                    warn!(id = %id, error = %e, "destroy failed during teardown");
                    self.nodes.lock().unwrap().remove(&id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::factory::{default_factory, NodeFactory};
    use crate::node::Node;
    use crate::server::{ChannelSink, EventSinkRef};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 存活的探针节点资源数; 计数断言的测试经 GATE 串行化
    static LIVE: AtomicUsize = AtomicUsize::new(0);
    static GATE: Mutex<()> = Mutex::new(());
    /// 探针节点的销毁顺序记录
    static ORDER: Mutex<Vec<String>> = Mutex::new(Vec::new());
    /// 两路并发创建的会合点: 保证双方都通过了前置检查
    static RENDEZVOUS: std::sync::OnceLock<std::sync::Barrier> = std::sync::OnceLock::new();

    fn serialized() -> std::sync::MutexGuard<'static, ()> {
        GATE.lock().unwrap_or_else(|e| e.into_inner())
    }

    struct ProbeNode {
        id: String,
        phase: NodePhase,
        stubborn: bool,
    }

    fn probe_ctor(id: String, _events: EventSinkRef) -> Box<dyn Node> {
        Box::new(ProbeNode {
            id,
            phase: NodePhase::Uninitialized,
            stubborn: false,
        })
    }

    impl Node for ProbeNode {
        fn node_type(&self) -> &'static str {
            "probe"
        }
        fn id(&self) -> &str {
            &self.id
        }
        fn phase(&self) -> NodePhase {
            self.phase
        }
        fn on_create(&mut self, config: &Value) -> Result<Value, NodeError> {
            if config.get("fail").is_some() {
                return Err(NodeError::ConfigInvalid("asked to fail".into()));
            }
            self.stubborn = config.get("stubborn").is_some();
            if config.get("rendezvous").is_some() {
                RENDEZVOUS
                    .get_or_init(|| std::sync::Barrier::new(2))
                    .wait();
            }
            LIVE.fetch_add(1, Ordering::SeqCst);
            self.phase = NodePhase::Created;
            Ok(Value::Null)
        }
        fn on_start(&mut self, _deps: &ResolvedDeps) -> Result<(), NodeError> {
            self.phase = NodePhase::Started;
            Ok(())
        }
        fn on_control(&mut self, command: &str, _data: &Value) -> Result<Value, NodeError> {
            Err(NodeError::Unsupported(command.into()))
        }
        fn on_stop(&mut self) -> Result<(), NodeError> {
            if self.phase == NodePhase::Started {
                self.phase = NodePhase::Stopped;
            }
            Ok(())
        }
        fn on_destroy(&mut self) -> Result<(), NodeError> {
            if self.stubborn {
                return Err(NodeError::ResourceUnavailable(
                    "refusing to release".into(),
                ));
            }
            if self.phase != NodePhase::Destroyed {
                if self.phase != NodePhase::Uninitialized {
                    LIVE.fetch_sub(1, Ordering::SeqCst);
                }
                ORDER.lock().unwrap().push(self.id.clone());
                self.phase = NodePhase::Destroyed;
            }
            Ok(())
        }
    }

    fn probe_graph() -> NodeGraph {
        let mut factory = NodeFactory::new();
        factory.register("probe", false, probe_ctor);
        let (sink, _rx) = ChannelSink::new();
        NodeGraph::new(factory, sink)
    }

    #[test]
    fn create_destroy_balances_resources() {
        let _gate = serialized();
        let graph = probe_graph();
        let before = LIVE.load(Ordering::SeqCst);
        graph.create("p0", "probe", &Value::Null, &[]).unwrap();
        graph.create("p1", "probe", &Value::Null, &["p0".into()]).unwrap();
        assert_eq!(LIVE.load(Ordering::SeqCst), before + 2);
        graph.destroy("p1").unwrap();
        graph.destroy("p0").unwrap();
        assert_eq!(LIVE.load(Ordering::SeqCst), before);
        assert!(graph.is_empty());
    }

    #[test]
    fn failed_create_leaves_no_trace() {
        let _gate = serialized();
        let graph = probe_graph();
        let before = LIVE.load(Ordering::SeqCst);
        assert!(graph
            .create("bad", "probe", &json!({"fail": true}), &[])
            .is_err());
        assert!(!graph.contains("bad"));
        assert_eq!(LIVE.load(Ordering::SeqCst), before);
    }

    #[test]
    fn duplicate_id_and_missing_dep_rejected() {
        let _gate = serialized();
        let graph = probe_graph();
        graph.create("p0", "probe", &Value::Null, &[]).unwrap();
        assert!(matches!(
            graph.create("p0", "probe", &Value::Null, &[]),
            Err(NodeError::ConfigInvalid(_))
        ));
        assert!(matches!(
            graph.create("p2", "probe", &Value::Null, &["ghost".into()]),
            Err(NodeError::DependencyMissing(_))
        ));
        graph.teardown();
    }

    #[test]
    fn singleton_type_allows_one_instance() {
        let (sink, _rx) = ChannelSink::new();
        let graph = NodeGraph::new(default_factory(), sink);
        graph
            .create("det0", "model", &json!({"uri": "builtin:blob"}), &[])
            .unwrap();
        assert!(matches!(
            graph.create("det1", "model", &json!({"uri": "builtin:blob"}), &[]),
            Err(NodeError::ConfigInvalid(_))
        ));
        assert_eq!(graph.find_by_type("model"), vec!["det0"]);
        graph.teardown();
    }

    #[test]
    fn start_without_required_producer_is_dependency_missing() {
        let (sink, _rx) = ChannelSink::new();
        let graph = NodeGraph::new(default_factory(), sink);
        graph
            .create("det0", "model", &json!({"uri": "builtin:blob"}), &[])
            .unwrap();
        assert!(matches!(
            graph.start("det0"),
            Err(NodeError::DependencyMissing(_))
        ));
        // 失败的 start 不改变生命周期阶段
        assert_eq!(graph.phase("det0").unwrap(), NodePhase::Created);
        graph.teardown();
    }

    #[test]
    fn teardown_destroys_dependents_before_producers() {
        let _gate = serialized();
        let graph = probe_graph();
        graph.create("p0", "probe", &Value::Null, &[]).unwrap();
        graph.create("p1", "probe", &Value::Null, &["p0".into()]).unwrap();
        let before = LIVE.load(Ordering::SeqCst);
        ORDER.lock().unwrap().clear();
        graph.teardown();
        assert!(graph.is_empty());
        assert_eq!(LIVE.load(Ordering::SeqCst), before - 2);
        // 消费者 p1 先于其生产者 p0 退场
        assert_eq!(*ORDER.lock().unwrap(), vec!["p1", "p0"]);
    }

    #[test]
    fn teardown_evicts_a_node_whose_destroy_fails() {
        let _gate = serialized();
        let graph = probe_graph();
        graph.create("p0", "probe", &Value::Null, &[]).unwrap();
        graph
            .create("bad", "probe", &json!({"stubborn": true}), &[])
            .unwrap();
        graph.teardown();
        // 销毁失败的节点同样被移出注册表, 拆除收敛
        assert!(graph.is_empty());
    }

    #[test]
    fn concurrent_creates_respect_the_singleton_constraint() {
        let _gate = serialized();
        let mut factory = NodeFactory::new();
        factory.register("probe", true, probe_ctor);
        let (sink, _rx) = ChannelSink::new();
        let graph = std::sync::Arc::new(NodeGraph::new(factory, sink));

        // 双方都在前置检查之后、注册之前会合, 逼出复检路径
        let other = std::sync::Arc::clone(&graph);
        let handle = std::thread::spawn(move || {
            other.create("s1", "probe", &json!({"rendezvous": true}), &[])
        });
        let first = graph.create("s0", "probe", &json!({"rendezvous": true}), &[]);
        let second = handle.join().unwrap();

        assert!(first.is_ok() != second.is_ok(), "exactly one create must win");
        assert_eq!(graph.len(), 1);
        graph.teardown();
    }
}
