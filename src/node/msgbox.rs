//! 有界邮箱: 生产者→消费者的帧引用队列
//! Bounded mailbox moving buffer references from producer to consumer
//!
//! 背压策略是丢弃最旧: 生产者永远不会被慢消费者阻塞, `post` 在队列
//! 满时挤掉最旧的未读条目。消费者用带超时的 `fetch` 阻塞取数, 超时
//! 返回 `None` 作为工作线程的协作取消点。
//! 每个 (生产者, 消费者) 挂载对应一个邮箱实例。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

static NEXT_BOX_ID: AtomicU64 = AtomicU64::new(1);

pub struct MessageBox<T> {
    id: u64,
    capacity: usize,
    tx: Sender<T>,
    rx: Receiver<T>,
}

// 手写 Clone: 克隆共享同一条队列与同一个挂载 id
impl<T> Clone for MessageBox<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            capacity: self.capacity,
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> MessageBox<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            id: NEXT_BOX_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            tx,
            rx,
        }
    }

    /// 挂载标识, 用于生产者端的 detach
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// 非阻塞投递; 队列满时丢弃最旧条目后重试 (被挤掉的引用随即释放)
    pub fn post(&self, item: T) {
        let mut item = item;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return,
                Err(TrySendError::Full(v)) => {
                    let _ = self.rx.try_recv();
                    item = v;
                }
                // 本结构同时持有收发两端, 正常情况下不会断开
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// 阻塞取数, 最多等待 `timeout`; 成功时该引用的所有权转移给调用者
    pub fn fetch(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// 非阻塞取数, 用于停机时排空滞留的引用
    pub fn try_fetch(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}
