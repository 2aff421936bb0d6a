//! PostgreSQL 消息存储
//!
//! 表名来自配置，无法参数化，只能拼进 SQL；列名固定。
//! `NoActiveTransaction` 在这里由类型系统保证：`insert_message`
//! 只接受 `Transaction` 句柄，没有事务就无从调用。

use async_trait::async_trait;
use obx_errors::{OutboxError, OutboxResult};
use obx_ports::{Message, MessageKind, MessageStore, NewMessage};
use serde::Deserialize;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::Transaction;
use tracing::debug;

/// PostgreSQL 锁冲突（lock_not_available）
const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";
/// 唯一约束冲突
const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";

/// 表命名配置
#[derive(Debug, Clone, Deserialize)]
pub struct PgStoreConfig {
    /// 可选 schema，缺省用连接的 search_path
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default = "default_outbox_table")]
    pub outbox_table: String,
    #[serde(default = "default_inbox_table")]
    pub inbox_table: String,
}

fn default_outbox_table() -> String {
    "outbox".to_string()
}

fn default_inbox_table() -> String {
    "inbox".to_string()
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            schema: None,
            outbox_table: default_outbox_table(),
            inbox_table: default_inbox_table(),
        }
    }
}

impl PgStoreConfig {
    /// 不带引号的表名
    pub fn table_name(&self, kind: MessageKind) -> &str {
        match kind {
            MessageKind::Outbox => &self.outbox_table,
            MessageKind::Inbox => &self.inbox_table,
        }
    }

    /// 带引号的完整表名，可直接拼入 SQL
    pub fn table(&self, kind: MessageKind) -> String {
        match &self.schema {
            Some(schema) => format!("\"{}\".\"{}\"", schema, self.table_name(kind)),
            None => format!("\"{}\"", self.table_name(kind)),
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    event_id: uuid::Uuid,
    created_at: chrono::DateTime<chrono::Utc>,
    #[sqlx(rename = "type")]
    type_tag: String,
    partition_key: String,
    data: String,
    retry_count: i32,
    processed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            event_id: row.event_id,
            created_at: row.created_at,
            type_tag: row.type_tag,
            partition_key: row.partition_key,
            data: row.data,
            retry_count: row.retry_count,
            processed_at: row.processed_at,
        }
    }
}

/// PostgreSQL 消息存储
pub struct PgMessageStore {
    pool: PgPool,
    config: PgStoreConfig,
}

impl PgMessageStore {
    pub fn new(pool: PgPool, config: PgStoreConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> OutboxResult<Self::Tx> {
        self.pool
            .begin()
            .await
            .map_err(|e| OutboxError::database(format!("Failed to begin transaction: {}", e)))
    }

    async fn commit(&self, tx: Self::Tx) -> OutboxResult<()> {
        tx.commit()
            .await
            .map_err(|e| OutboxError::database(format!("Failed to commit transaction: {}", e)))
    }

    async fn rollback(&self, tx: Self::Tx) -> OutboxResult<()> {
        tx.rollback()
            .await
            .map_err(|e| OutboxError::database(format!("Failed to rollback transaction: {}", e)))
    }

    async fn list_pending_partitions(&self, kind: MessageKind) -> OutboxResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(&format!(
            "SELECT DISTINCT partition_key FROM {} WHERE processed_at IS NULL",
            self.config.table(kind)
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OutboxError::database(format!("Failed to list pending partitions: {}", e)))
    }

    async fn claim_batch(
        &self,
        tx: &mut Self::Tx,
        kind: MessageKind,
        partition_key: &str,
        batch_size: usize,
    ) -> OutboxResult<Vec<Message>> {
        // NOWAIT 而不是 SKIP LOCKED：多实例同时运行时避免死锁，
        // 同时保证认领的是分区头部、顺序不被跳过
        let sql = format!(
            r#"
            SELECT id, event_id, created_at, type, partition_key, data, retry_count, processed_at
            FROM {}
            WHERE processed_at IS NULL AND partition_key = $1
            ORDER BY id
            LIMIT $2
            FOR UPDATE NOWAIT
            "#,
            self.config.table(kind)
        );

        match sqlx::query_as::<_, MessageRow>(&sql)
            .bind(partition_key)
            .bind(batch_size as i64)
            .fetch_all(&mut **tx)
            .await
        {
            Ok(rows) => Ok(rows.into_iter().map(Into::into).collect()),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(SQLSTATE_LOCK_NOT_AVAILABLE) => {
                // 其他事务已持有这些行：本轮视为无工作
                debug!(partition_key, "Row lock held elsewhere, claiming nothing");
                Ok(Vec::new())
            }
            Err(e) => Err(OutboxError::database(format!(
                "Failed to claim batch: {}",
                e
            ))),
        }
    }

    async fn savepoint(&self, tx: &mut Self::Tx, name: &str) -> OutboxResult<()> {
        sqlx::query(&format!("SAVEPOINT {}", name))
            .execute(&mut **tx)
            .await
            .map_err(|e| OutboxError::database(format!("Failed to create savepoint: {}", e)))?;
        Ok(())
    }

    async fn release_savepoint(&self, tx: &mut Self::Tx, name: &str) -> OutboxResult<()> {
        sqlx::query(&format!("RELEASE SAVEPOINT {}", name))
            .execute(&mut **tx)
            .await
            .map_err(|e| OutboxError::database(format!("Failed to release savepoint: {}", e)))?;
        Ok(())
    }

    async fn rollback_to_savepoint(&self, tx: &mut Self::Tx, name: &str) -> OutboxResult<()> {
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", name))
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                OutboxError::database(format!("Failed to rollback to savepoint: {}", e))
            })?;
        Ok(())
    }

    async fn mark_processed(
        &self,
        tx: &mut Self::Tx,
        kind: MessageKind,
        ids: &[i64],
    ) -> OutboxResult<()> {
        sqlx::query(&format!(
            "UPDATE {} SET processed_at = NOW() WHERE id = ANY($1)",
            self.config.table(kind)
        ))
        .bind(ids)
        .execute(&mut **tx)
        .await
        .map_err(|e| OutboxError::database(format!("Failed to mark messages processed: {}", e)))?;
        Ok(())
    }

    async fn increment_retry(
        &self,
        tx: &mut Self::Tx,
        kind: MessageKind,
        id: i64,
    ) -> OutboxResult<()> {
        sqlx::query(&format!(
            "UPDATE {} SET retry_count = retry_count + 1 WHERE id = $1",
            self.config.table(kind)
        ))
        .bind(id)
        .execute(&mut **tx)
        .await
        .map_err(|e| OutboxError::database(format!("Failed to increment retry count: {}", e)))?;
        Ok(())
    }

    async fn delete_message(
        &self,
        tx: &mut Self::Tx,
        kind: MessageKind,
        id: i64,
    ) -> OutboxResult<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE id = $1",
            self.config.table(kind)
        ))
        .bind(id)
        .execute(&mut **tx)
        .await
        .map_err(|e| OutboxError::database(format!("Failed to delete message: {}", e)))?;
        Ok(())
    }

    async fn insert_message(
        &self,
        tx: &mut Self::Tx,
        kind: MessageKind,
        message: &NewMessage,
    ) -> OutboxResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (event_id, created_at, type, partition_key, data)
            VALUES ($1, $2, $3, $4, $5)
            "#,
            self.config.table(kind)
        );

        match sqlx::query(&sql)
            .bind(message.event_id)
            .bind(message.created_at)
            .bind(&message.type_tag)
            .bind(&message.partition_key)
            .bind(&message.data)
            .execute(&mut **tx)
            .await
        {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(SQLSTATE_UNIQUE_VIOLATION) => {
                Err(OutboxError::DuplicateEventId(message.event_id))
            }
            Err(e) => Err(OutboxError::database(format!(
                "Failed to insert message: {}",
                e
            ))),
        }
    }
}
