//! 批处理器
//!
//! 每次调用处理一个分区的一批消息：单个事务内认领、逐条在
//! savepoint 内分发、成功的批量标记、一次性提交。原子性在
//! 批次提交边界：提交前崩溃或失败，整批消息保持待处理原样。

use std::sync::Arc;

use obx_errors::OutboxResult;
use obx_ports::{MessageKind, MessageStore};
use tracing::{debug, error, info};

use crate::dispatcher::{DispatchOutcome, HandlerRegistry};
use crate::policy::{BatchFlow, DispatchFailure, PolicyChain, PolicyOutcome};

/// 一次批处理的结果，调度器据此决定是否立即重新入队该分区
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchResult {
    /// 本轮已无剩余（空批次，或有消息失败被留下）
    Drained,
    /// 认领的消息全部成功，分区可能还有更多消息
    MorePending,
}

/// 分区批处理器
pub struct BatchProcessor<S: MessageStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry<S::Tx>>,
    policies: PolicyChain<S>,
    kind: MessageKind,
    batch_size: usize,
}

impl<S: MessageStore> BatchProcessor<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<HandlerRegistry<S::Tx>>,
        policies: PolicyChain<S>,
        kind: MessageKind,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            registry,
            policies,
            kind,
            batch_size,
        }
    }

    /// 处理一个分区的一批消息
    ///
    /// 调用方必须已持有该分区的锁。存储级失败时整个事务回滚，
    /// 错误向上传递（由 worker 记录，分区留待下一轮重扫）。
    pub async fn process_partition(&self, partition_key: &str) -> OutboxResult<BatchResult> {
        let mut tx = self.store.begin().await?;

        match self.process_in_tx(&mut tx, partition_key).await {
            Ok(result) => {
                self.store.commit(tx).await?;
                Ok(result)
            }
            Err(e) => {
                // 回滚失败不掩盖原始错误
                if let Err(rollback_err) = self.store.rollback(tx).await {
                    error!(error = %rollback_err, "Failed to roll back batch transaction");
                }
                Err(e)
            }
        }
    }

    async fn process_in_tx(
        &self,
        tx: &mut S::Tx,
        partition_key: &str,
    ) -> OutboxResult<BatchResult> {
        let messages = self
            .store
            .claim_batch(tx, self.kind, partition_key, self.batch_size)
            .await?;

        if messages.is_empty() {
            debug!(
                kind = %self.kind,
                partition_key,
                "No claimable messages in partition"
            );
            return Ok(BatchResult::Drained);
        }

        info!(
            count = messages.len(),
            kind = %self.kind,
            partition_key,
            "Processing batch"
        );

        let mut succeeded: Vec<i64> = Vec::new();

        for message in &messages {
            let savepoint = format!("processing_message_{}", message.id);
            self.store.savepoint(tx, &savepoint).await?;

            match self.registry.dispatch(tx, message).await {
                DispatchOutcome::Success => {
                    self.store.release_savepoint(tx, &savepoint).await?;
                    succeeded.push(message.id);
                }
                DispatchOutcome::UnresolvedType { reason } => {
                    error!(
                        message_id = message.id,
                        type_tag = %message.type_tag,
                        reason,
                        "Cannot resolve handler for message, will retry"
                    );
                    self.store.rollback_to_savepoint(tx, &savepoint).await?;
                    // 配置缺陷：递增重试保持可见，不丢弃，不中止批次
                    self.store
                        .increment_retry(tx, self.kind, message.id)
                        .await?;
                }
                DispatchOutcome::Failed { cause, discard } => {
                    error!(
                        message_id = message.id,
                        type_tag = %message.type_tag,
                        error = %cause,
                        "Error processing message in handler"
                    );
                    // 处理器的侧效应随 savepoint 消失，已成功的消息不受影响
                    self.store.rollback_to_savepoint(tx, &savepoint).await?;

                    let failure = DispatchFailure { cause, discard };
                    let directive = self
                        .policies
                        .run(&self.store, tx, self.kind, message, &failure)
                        .await?;

                    if directive.outcome == PolicyOutcome::Discarded {
                        debug!(message_id = message.id, "Message discarded");
                    }
                    if directive.flow == BatchFlow::StopBatch {
                        break;
                    }
                }
            }
        }

        if !succeeded.is_empty() {
            self.store
                .mark_processed(tx, self.kind, &succeeded)
                .await?;
        }

        // 整批全部成功才值得立即重新入队（与空批次和失败路径区分）
        if succeeded.len() == messages.len() {
            Ok(BatchResult::MorePending)
        } else {
            Ok(BatchResult::Drained)
        }
    }
}
