//! Outbox/Inbox 门面
//!
//! 写入必须发生在调用方的活动事务内，与业务写入原子地提交或
//! 回滚。`trigger_processing` 只投递信号，从不阻塞、从不报错。

use std::sync::Arc;

use obx_errors::OutboxResult;
use obx_ports::{MessageKind, MessageStore, NewMessage};

use crate::scheduler::TriggerHandle;

/// Outbox 门面：待发布的事件
pub struct Outbox<S: MessageStore> {
    store: Arc<S>,
    trigger: TriggerHandle,
}

impl<S: MessageStore> Outbox<S> {
    pub fn new(store: Arc<S>, trigger: TriggerHandle) -> Self {
        Self { store, trigger }
    }

    /// 在调用方事务内写入一条消息
    pub async fn add_message(&self, tx: &mut S::Tx, message: NewMessage) -> OutboxResult<()> {
        self.store
            .insert_message(tx, MessageKind::Outbox, &message)
            .await
    }

    /// 批量写入
    pub async fn add_messages(&self, tx: &mut S::Tx, messages: &[NewMessage]) -> OutboxResult<()> {
        for message in messages {
            self.store
                .insert_message(tx, MessageKind::Outbox, message)
                .await?;
        }
        Ok(())
    }

    /// 调度一次带外处理
    pub fn trigger_processing(&self) {
        self.trigger.fire();
    }
}

/// Inbox 门面：待消费的外部消息
pub struct Inbox<S: MessageStore> {
    store: Arc<S>,
    trigger: TriggerHandle,
}

impl<S: MessageStore> Inbox<S> {
    pub fn new(store: Arc<S>, trigger: TriggerHandle) -> Self {
        Self { store, trigger }
    }

    /// 在调用方事务内写入一条消息
    pub async fn add_message(&self, tx: &mut S::Tx, message: NewMessage) -> OutboxResult<()> {
        self.store
            .insert_message(tx, MessageKind::Inbox, &message)
            .await
    }

    /// 批量写入
    pub async fn add_messages(&self, tx: &mut S::Tx, messages: &[NewMessage]) -> OutboxResult<()> {
        for message in messages {
            self.store
                .insert_message(tx, MessageKind::Inbox, message)
                .await?;
        }
        Ok(())
    }

    /// 调度一次带外处理
    pub fn trigger_processing(&self) {
        self.trigger.fire();
    }
}
