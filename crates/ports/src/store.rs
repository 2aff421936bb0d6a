//! 消息存储 trait 定义
//!
//! 关系存储需要提供：带 savepoint 的事务、非阻塞行锁（NOWAIT 语义）、
//! 单调递增 id 与 `event_id` 唯一约束。

use async_trait::async_trait;
use obx_errors::OutboxResult;

use crate::{Message, MessageKind, NewMessage};

/// 消息存储抽象
///
/// 所有认领内的变更（标记处理、递增重试、删除）都在认领事务中执行，
/// 随批次一次性提交。
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// 事务句柄
    type Tx: Send;

    /// 开始事务
    async fn begin(&self) -> OutboxResult<Self::Tx>;

    /// 提交事务
    async fn commit(&self, tx: Self::Tx) -> OutboxResult<()>;

    /// 回滚事务
    async fn rollback(&self, tx: Self::Tx) -> OutboxResult<()>;

    /// 查询有待处理消息的分区键（去重）
    ///
    /// 只读、无锁，允许返回陈旧或重复结果：下游的分区锁会安全地消化它们。
    async fn list_pending_partitions(&self, kind: MessageKind) -> OutboxResult<Vec<String>>;

    /// 在当前事务内认领一批待处理消息，按 id 升序
    ///
    /// 行锁必须是非阻塞的（Postgres 上 `FOR UPDATE NOWAIT`）：锁冲突
    /// 返回空批次而不是错误。这是 advisory lock 之下的第二道防线。
    async fn claim_batch(
        &self,
        tx: &mut Self::Tx,
        kind: MessageKind,
        partition_key: &str,
        batch_size: usize,
    ) -> OutboxResult<Vec<Message>>;

    /// 创建 savepoint
    async fn savepoint(&self, tx: &mut Self::Tx, name: &str) -> OutboxResult<()>;

    /// 释放 savepoint
    async fn release_savepoint(&self, tx: &mut Self::Tx, name: &str) -> OutboxResult<()>;

    /// 回滚到 savepoint（只撤销该点之后的效果）
    async fn rollback_to_savepoint(&self, tx: &mut Self::Tx, name: &str) -> OutboxResult<()>;

    /// 批量标记为已处理
    async fn mark_processed(
        &self,
        tx: &mut Self::Tx,
        kind: MessageKind,
        ids: &[i64],
    ) -> OutboxResult<()>;

    /// 递增重试计数，`processed_at` 保持为空
    async fn increment_retry(
        &self,
        tx: &mut Self::Tx,
        kind: MessageKind,
        id: i64,
    ) -> OutboxResult<()>;

    /// 永久删除消息（丢弃策略的终态）
    async fn delete_message(
        &self,
        tx: &mut Self::Tx,
        kind: MessageKind,
        id: i64,
    ) -> OutboxResult<()>;

    /// 在调用方事务内插入消息
    ///
    /// 返回 `NoActiveTransaction` 或 `DuplicateEventId` 时调用方可纠正。
    async fn insert_message(
        &self,
        tx: &mut Self::Tx,
        kind: MessageKind,
        message: &NewMessage,
    ) -> OutboxResult<()>;
}
