//! 表结构初始化
//!
//! Outbox 与 Inbox 共享同一结构。DDL 全部 IF NOT EXISTS，重复
//! 执行安全，多实例同时启动时靠 PostgreSQL 自身的 DDL 锁串行化。

use obx_errors::{OutboxError, OutboxResult};
use obx_ports::MessageKind;
use sqlx::postgres::PgPool;
use tracing::info;

use crate::store::PgStoreConfig;

/// 建表与索引
pub async fn run_migrations(pool: &PgPool, config: &PgStoreConfig) -> OutboxResult<()> {
    if let Some(schema) = &config.schema {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema))
            .execute(pool)
            .await
            .map_err(|e| OutboxError::database(format!("Failed to create schema: {}", e)))?;
    }

    for kind in [MessageKind::Outbox, MessageKind::Inbox] {
        let table = config.table(kind);
        let name = config.table_name(kind);

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id            BIGSERIAL PRIMARY KEY,
                event_id      UUID NOT NULL,
                created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                type          TEXT NOT NULL,
                partition_key TEXT NOT NULL DEFAULT 'default',
                data          TEXT NOT NULL,
                retry_count   INT NOT NULL DEFAULT 0,
                processed_at  TIMESTAMPTZ
            )
            "#
        ))
        .execute(pool)
        .await
        .map_err(|e| OutboxError::database(format!("Failed to create table {}: {}", name, e)))?;

        // 生产侧幂等依赖 event_id 唯一
        sqlx::query(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS \"idx_{name}_event_id\" ON {table} (event_id)"
        ))
        .execute(pool)
        .await
        .map_err(|e| OutboxError::database(format!("Failed to create event_id index: {}", e)))?;

        // 分区发现与认领都按 (processed_at, partition_key) 过滤
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{name}_pending\" ON {table} (partition_key, id) WHERE processed_at IS NULL"
        ))
        .execute(pool)
        .await
        .map_err(|e| OutboxError::database(format!("Failed to create pending index: {}", e)))?;

        info!(table = name, "Message table ready");
    }

    Ok(())
}
