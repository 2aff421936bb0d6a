//! 分发器与处理器注册表
//!
//! 启动时显式注册「类型标签 → 处理器」映射，分发时按消息的
//! `type_tag` 查找处理器、反序列化负载并调用。注册表只依赖
//! 分发契约，不关心映射如何构建。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use obx_ports::{Message, MessageHandler};
use tracing::debug;

/// 一次分发的结果
pub enum DispatchOutcome {
    Success,
    /// 没有注册处理器，或负载无法反序列化。
    /// 配置缺陷而不是瞬时故障：记录并重试，永不自动丢弃。
    UnresolvedType { reason: String },
    /// 处理器执行失败；`discard` 是处理器对该失败原因的丢弃判定
    Failed {
        cause: anyhow::Error,
        discard: bool,
    },
}

#[async_trait]
trait ErasedHandler<Tx: Send>: Send + Sync {
    async fn dispatch(&self, tx: &mut Tx, message: &Message) -> DispatchOutcome;
}

struct TypedAdapter<H>(H);

#[async_trait]
impl<Tx, H> ErasedHandler<Tx> for TypedAdapter<H>
where
    Tx: Send + 'static,
    H: MessageHandler<Tx>,
{
    async fn dispatch(&self, tx: &mut Tx, message: &Message) -> DispatchOutcome {
        let payload: H::Payload = match serde_json::from_str(&message.data) {
            Ok(payload) => payload,
            Err(e) => {
                return DispatchOutcome::UnresolvedType {
                    reason: format!("Cannot parse payload of message {}: {}", message.id, e),
                };
            }
        };

        let metadata = message.metadata();
        match self.0.handle(tx, payload, &metadata).await {
            Ok(()) => DispatchOutcome::Success,
            Err(cause) => {
                let discard = self.0.discard_on(&cause);
                DispatchOutcome::Failed { cause, discard }
            }
        }
    }
}

/// 处理器注册表
///
/// 启动期构建一次，之后只读。同一标签重复注册是配置错误，
/// 立即 panic 暴露问题。
pub struct HandlerRegistry<Tx: Send> {
    handlers: HashMap<String, Arc<dyn ErasedHandler<Tx>>>,
}

impl<Tx: Send + 'static> HandlerRegistry<Tx> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// 注册处理器
    pub fn register<H>(mut self, type_tag: impl Into<String>, handler: H) -> Self
    where
        H: MessageHandler<Tx>,
    {
        let type_tag = type_tag.into();
        if self
            .handlers
            .insert(type_tag.clone(), Arc::new(TypedAdapter(handler)))
            .is_some()
        {
            panic!("Handler already registered for type '{}'", type_tag);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// 分发一条消息
    pub async fn dispatch(&self, tx: &mut Tx, message: &Message) -> DispatchOutcome {
        let Some(handler) = self.handlers.get(&message.type_tag) else {
            return DispatchOutcome::UnresolvedType {
                reason: format!(
                    "No handler registered for type '{}' of message {}",
                    message.type_tag, message.id
                ),
            };
        };

        debug!(
            message_id = message.id,
            type_tag = %message.type_tag,
            "Dispatching message"
        );
        handler.dispatch(tx, message).await
    }
}

impl<Tx: Send + 'static> Default for HandlerRegistry<Tx> {
    fn default() -> Self {
        Self::new()
    }
}
