//! 错误/重试策略链
//!
//! 分发失败后按顺序咨询各策略，首个给出裁决的生效。策略在
//! 批次事务内执行（savepoint 已回滚处理器的侧效应），所以
//! 删除/递增与批次一同提交。

use async_trait::async_trait;
use obx_errors::OutboxResult;
use obx_ports::{Message, MessageKind, MessageStore};
use tracing::{info, warn};

/// 分发失败的描述，供策略链检查
pub struct DispatchFailure {
    /// 处理器抛出的原始错误
    pub cause: anyhow::Error,
    /// 处理器对该原因的丢弃判定（`MessageHandler::discard_on`）
    pub discard: bool,
}

/// 失败消息对批次剩余部分的影响
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchFlow {
    /// 中止本批次剩余消息（保持分区内顺序）
    StopBatch,
    /// 跳过该消息继续处理
    ContinueBatch,
}

/// 策略对失败消息的处置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOutcome {
    /// 消息已永久删除
    Discarded,
    /// 重试计数已递增，消息保持待处理
    Retried,
}

/// 策略裁决
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorDirective {
    pub outcome: PolicyOutcome,
    pub flow: BatchFlow,
}

/// 单个错误策略
///
/// 返回 `None` 表示不裁决，交给链中的下一个策略。
#[async_trait]
pub trait ErrorPolicy<S: MessageStore>: Send + Sync + 'static {
    async fn handle(
        &self,
        store: &S,
        tx: &mut S::Tx,
        kind: MessageKind,
        message: &Message,
        failure: &DispatchFailure,
    ) -> OutboxResult<Option<ErrorDirective>>;
}

/// 丢弃策略：处理器声明了对该失败原因丢弃时，永久删除消息
pub struct DiscardOnErrorPolicy;

#[async_trait]
impl<S: MessageStore> ErrorPolicy<S> for DiscardOnErrorPolicy {
    async fn handle(
        &self,
        store: &S,
        tx: &mut S::Tx,
        kind: MessageKind,
        message: &Message,
        failure: &DispatchFailure,
    ) -> OutboxResult<Option<ErrorDirective>> {
        if !failure.discard {
            return Ok(None);
        }

        info!(
            message_id = message.id,
            type_tag = %message.type_tag,
            cause = %failure.cause,
            "Handler declared discard for this failure, deleting message"
        );
        store.delete_message(tx, kind, message.id).await?;

        Ok(Some(ErrorDirective {
            outcome: PolicyOutcome::Discarded,
            flow: BatchFlow::ContinueBatch,
        }))
    }
}

/// 缺省重试策略：递增重试计数，消息留待下一轮扫描重新认领
pub struct RetryOnErrorPolicy {
    stop_batch_on_error: bool,
}

impl RetryOnErrorPolicy {
    pub fn new(stop_batch_on_error: bool) -> Self {
        Self {
            stop_batch_on_error,
        }
    }
}

#[async_trait]
impl<S: MessageStore> ErrorPolicy<S> for RetryOnErrorPolicy {
    async fn handle(
        &self,
        store: &S,
        tx: &mut S::Tx,
        kind: MessageKind,
        message: &Message,
        _failure: &DispatchFailure,
    ) -> OutboxResult<Option<ErrorDirective>> {
        store.increment_retry(tx, kind, message.id).await?;

        Ok(Some(ErrorDirective {
            outcome: PolicyOutcome::Retried,
            flow: if self.stop_batch_on_error {
                BatchFlow::StopBatch
            } else {
                BatchFlow::ContinueBatch
            },
        }))
    }
}

/// 有序策略链
pub struct PolicyChain<S: MessageStore> {
    policies: Vec<Box<dyn ErrorPolicy<S>>>,
}

impl<S: MessageStore> PolicyChain<S> {
    pub fn new(policies: Vec<Box<dyn ErrorPolicy<S>>>) -> Self {
        Self { policies }
    }

    /// 缺省链：丢弃策略在前，重试策略兜底
    pub fn default_chain(stop_batch_on_error: bool) -> Self {
        Self::new(vec![
            Box::new(DiscardOnErrorPolicy),
            Box::new(RetryOnErrorPolicy::new(stop_batch_on_error)),
        ])
    }

    /// 运行策略链，返回首个裁决
    ///
    /// 所有策略都弃权时回落为「重试并中止批次」：消息绝不能因为
    /// 链配置不当而丢失。
    pub async fn run(
        &self,
        store: &S,
        tx: &mut S::Tx,
        kind: MessageKind,
        message: &Message,
        failure: &DispatchFailure,
    ) -> OutboxResult<ErrorDirective> {
        for policy in &self.policies {
            if let Some(directive) = policy.handle(store, tx, kind, message, failure).await? {
                return Ok(directive);
            }
        }

        warn!(
            message_id = message.id,
            "No error policy produced a directive, falling back to retry + stop"
        );
        store.increment_retry(tx, kind, message.id).await?;
        Ok(ErrorDirective {
            outcome: PolicyOutcome::Retried,
            flow: BatchFlow::StopBatch,
        })
    }
}
