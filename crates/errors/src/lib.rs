//! obx-errors - 统一错误处理
//!
//! Outbox/Inbox 引擎的错误分类。锁竞争与行锁冲突不在此列：
//! 它们是高频的正常状态，以值（`None` / 空批次）表达，而不是错误。

use thiserror::Error;
use uuid::Uuid;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum OutboxError {
    /// 调用方在没有打开事务的情况下调用了 `add_message`
    #[error("No active transaction: add_message must run inside the caller's transaction")]
    NoActiveTransaction,

    /// `event_id` 唯一约束冲突（生产侧幂等保证）
    #[error("Duplicate event_id: {0}")]
    DuplicateEventId(Uuid),

    /// 消息类型无法解析到处理器（配置缺陷，不是瞬时故障）
    #[error("Unresolved message type: {0}")]
    UnresolvedType(String),

    /// 业务处理器执行失败
    #[error("Handler error: {0}")]
    Handler(String),

    /// 存储/事务级失败
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl OutboxError {
    pub fn unresolved_type(msg: impl Into<String>) -> Self {
        Self::UnresolvedType(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// 是否为调用方可纠正的同步错误
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::NoActiveTransaction | Self::DuplicateEventId(_) | Self::Configuration(_)
        )
    }
}

/// 应用结果类型
pub type OutboxResult<T> = Result<T, OutboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OutboxError::database("connection refused");
        assert_eq!(err.to_string(), "Database error: connection refused");

        let err = OutboxError::NoActiveTransaction;
        assert!(err.to_string().contains("No active transaction"));
    }

    #[test]
    fn test_caller_errors() {
        assert!(OutboxError::NoActiveTransaction.is_caller_error());
        assert!(OutboxError::DuplicateEventId(Uuid::new_v4()).is_caller_error());
        assert!(!OutboxError::database("boom").is_caller_error());
        assert!(!OutboxError::unresolved_type("x").is_caller_error());
    }
}
