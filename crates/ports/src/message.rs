//! 消息模型
//!
//! Outbox 与 Inbox 共享同一行结构，仅表不同。`id` 由存储分配，
//! 在同一 partition 内定义认领与处理顺序。

use std::fmt;

use chrono::{DateTime, Utc};
use obx_errors::{OutboxError, OutboxResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 消息归属的表（实体种类）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Outbox,
    Inbox,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Outbox => "outbox",
            MessageKind::Inbox => "inbox",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 已持久化的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// 存储分配的单调递增序号，分区内的处理顺序
    pub id: i64,
    /// 调用方提供的唯一标识，生产侧幂等的唯一依据
    pub event_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// 类型标签，Dispatcher 据此路由到处理器
    pub type_tag: String,
    /// 同一 partition_key 的消息严格按 id 顺序投递
    pub partition_key: String,
    /// 序列化后的负载，对引擎不透明
    pub data: String,
    /// 仅由错误策略链递增
    pub retry_count: i32,
    /// `None` = 待处理；非空 = 终态成功，只设置一次
    pub processed_at: Option<DateTime<Utc>>,
}

impl Message {
    /// 是否可被认领
    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none()
    }

    /// 生成传递给处理器的元数据
    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            event_id: self.event_id,
            partition_key: self.partition_key.clone(),
            retry_count: self.retry_count,
        }
    }
}

/// 待插入的消息（`id`、`retry_count`、`processed_at` 由存储管理）
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub event_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub type_tag: String,
    pub partition_key: String,
    pub data: String,
}

impl NewMessage {
    /// 创建消息，负载已预先序列化
    pub fn new(event_id: Uuid, type_tag: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_id,
            created_at: Utc::now(),
            type_tag: type_tag.into(),
            partition_key: "default".to_string(),
            data: data.into(),
        }
    }

    /// 从任意可序列化负载创建消息
    pub fn from_payload<T: Serialize>(
        event_id: Uuid,
        type_tag: impl Into<String>,
        payload: &T,
    ) -> OutboxResult<Self> {
        let data = serde_json::to_string(payload)
            .map_err(|e| OutboxError::serialization(format!("Failed to serialize payload: {}", e)))?;
        Ok(Self::new(event_id, type_tag, data))
    }

    /// 设置分区键
    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = partition_key.into();
        self
    }
}

/// 处理消息时传递给处理器的元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub event_id: Uuid,
    pub partition_key: String,
    pub retry_count: i32,
}
