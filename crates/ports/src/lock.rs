//! 分布式锁 trait 定义
//!
//! (实体种类, 分区键) 级别的命名互斥锁。非阻塞：锁被他人持有时
//! 立即返回 `None`，调用方应当跳过该分区而不是报错。

use std::fmt;

use async_trait::async_trait;
use obx_errors::OutboxResult;

use crate::MessageKind;

/// 锁键：(实体种类, 分区键)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub kind: MessageKind,
    pub partition_key: String,
}

impl LockKey {
    pub fn new(kind: MessageKind, partition_key: impl Into<String>) -> Self {
        Self {
            kind,
            partition_key: partition_key.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.partition_key)
    }
}

/// 锁守卫
///
/// 显式 `release` 或 drop 时必须释放锁；进程崩溃时由后端的
/// 连接丢失语义兜底。永久持有的锁是活性缺陷。
#[async_trait]
pub trait LockGuard: Send + 'static {
    /// 释放锁
    async fn release(self);
}

/// 分布式锁提供者
#[async_trait]
pub trait LockProvider: Send + Sync + 'static {
    type Guard: LockGuard;

    /// 尝试获取锁，非阻塞
    ///
    /// `None` 表示其他 worker（本进程或其他实例）正在处理该分区。
    async fn try_acquire(&self, key: &LockKey) -> OutboxResult<Option<Self::Guard>>;
}
