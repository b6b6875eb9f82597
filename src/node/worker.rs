//! 节点工作线程
//! Per-node worker thread
//!
//! 每个节点实例绑定一条命名的系统线程。停止是协作式的: `stop` 翻转
//! 运行标志并 join, 循环体必须在每次有界等待后检查 `is_running`。
//! 临界区以独占访问节点共享状态 `S` 的形式表达 (`enter`), 工作线程
//! 组装一条应答的过程与并发的 `control()` 修改互相串行化。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::NodeError;

/// 传入线程体的句柄: 运行标志 + 共享状态
pub struct WorkerScope<S> {
    running: Arc<AtomicBool>,
    state: Arc<Mutex<S>>,
}

impl<S> Clone for WorkerScope<S> {
    fn clone(&self) -> Self {
        Self {
            running: Arc::clone(&self.running),
            state: Arc::clone(&self.state),
        }
    }
}

impl<S> WorkerScope<S> {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 临界区: 独占共享状态执行 `f`
    pub fn enter<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut guard = self.state.lock().unwrap();
        f(&mut guard)
    }
}

pub struct Worker<S> {
    name: String,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<S>>,
    handle: Option<JoinHandle<()>>,
}

impl<S: Send + 'static> Worker<S> {
    pub fn new(name: impl Into<String>, state: S) -> Self {
        Self {
            name: name.into(),
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(state)),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && self.running.load(Ordering::Acquire)
    }

    /// 控制侧的临界区入口, 与线程体内的 `WorkerScope::enter` 互斥
    pub fn enter<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut guard = self.state.lock().unwrap();
        f(&mut guard)
    }

    /// 启动线程体; 已在运行时是幂等空操作
    pub fn start<F>(&mut self, body: F) -> Result<(), NodeError>
    where
        F: FnOnce(WorkerScope<S>) + Send + 'static,
    {
        if self.handle.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);
        let scope = WorkerScope {
            running: Arc::clone(&self.running),
            state: Arc::clone(&self.state),
        };
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || body(scope))
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                NodeError::AllocationFailed(format!("thread spawn failed: {e}"))
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    /// 翻转运行标志并 join; 线程体在下一次有界等待醒来后退出。
    /// 未启动时是幂等空操作。
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<S> Drop for Worker<S> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
