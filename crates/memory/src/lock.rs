//! 内存锁提供者
//!
//! 进程内的 (种类, 分区) 互斥，语义与 Postgres advisory lock 对齐：
//! 非阻塞获取，守卫释放或 drop 时解锁。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use obx_errors::OutboxResult;
use obx_ports::{LockGuard, LockKey, LockProvider};

/// 内存锁提供者
#[derive(Clone, Default)]
pub struct MemoryLockProvider {
    held: Arc<Mutex<HashSet<String>>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前是否有人持有该键（测试辅助）
    pub fn is_held(&self, key: &LockKey) -> bool {
        self.held
            .lock()
            .expect("lock table poisoned")
            .contains(&key.to_string())
    }
}

/// 内存锁守卫
pub struct MemoryLockGuard {
    held: Arc<Mutex<HashSet<String>>>,
    key: String,
    released: bool,
}

impl MemoryLockGuard {
    fn unlock(&mut self) {
        if !self.released {
            self.held.lock().expect("lock table poisoned").remove(&self.key);
            self.released = true;
        }
    }
}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[async_trait]
impl LockGuard for MemoryLockGuard {
    async fn release(mut self) {
        self.unlock();
    }
}

#[async_trait]
impl LockProvider for MemoryLockProvider {
    type Guard = MemoryLockGuard;

    async fn try_acquire(&self, key: &LockKey) -> OutboxResult<Option<MemoryLockGuard>> {
        let rendered = key.to_string();
        let mut held = self.held.lock().expect("lock table poisoned");
        if held.contains(&rendered) {
            return Ok(None);
        }
        held.insert(rendered.clone());
        Ok(Some(MemoryLockGuard {
            held: self.held.clone(),
            key: rendered,
            released: false,
        }))
    }
}
