//! PostgreSQL 咨询锁
//!
//! 用 `pg_try_advisory_lock` 做跨实例互斥。锁是会话级的：守卫
//! 独占一个池连接，显式释放走 `pg_advisory_unlock`；连接中断时
//! 服务端自动释放，不会留下永久持锁。

use async_trait::async_trait;
use obx_errors::{OutboxError, OutboxResult};
use obx_ports::{LockGuard, LockKey, LockProvider};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::Connection;
use tracing::warn;

/// 把任意字符串键映射为两个 int4 锁参数：md5 前 16 个十六进制位
/// 拆成两段，各转一个 32 位整数。确定性映射，不要求无碰撞。
const TRY_LOCK_SQL: &str = r#"
    SELECT pg_try_advisory_lock(
        ('x' || substr(md5($1), 1, 8))::bit(32)::int,
        ('x' || substr(md5($1), 9, 8))::bit(32)::int
    )
"#;

const UNLOCK_SQL: &str = r#"
    SELECT pg_advisory_unlock(
        ('x' || substr(md5($1), 1, 8))::bit(32)::int,
        ('x' || substr(md5($1), 9, 8))::bit(32)::int
    )
"#;

/// PostgreSQL 咨询锁提供者
#[derive(Clone)]
pub struct PgLockProvider {
    pool: PgPool,
}

impl PgLockProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockProvider for PgLockProvider {
    type Guard = PgLockGuard;

    async fn try_acquire(&self, key: &LockKey) -> OutboxResult<Option<Self::Guard>> {
        let key = key.to_string();

        // 锁绑定在会话上，必须独占一个连接直到释放
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| OutboxError::database(format!("Failed to acquire connection: {}", e)))?;

        let acquired: bool = sqlx::query_scalar(TRY_LOCK_SQL)
            .bind(&key)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| OutboxError::database(format!("Failed to try advisory lock: {}", e)))?;

        if acquired {
            Ok(Some(PgLockGuard {
                conn: Some(conn),
                key,
            }))
        } else {
            Ok(None)
        }
    }
}

/// 持有中的咨询锁，同时占有其会话连接
pub struct PgLockGuard {
    conn: Option<PoolConnection<Postgres>>,
    key: String,
}

#[async_trait]
impl LockGuard for PgLockGuard {
    async fn release(mut self) {
        if let Some(mut conn) = self.conn.take() {
            let result = sqlx::query_scalar::<_, bool>(UNLOCK_SQL)
                .bind(&self.key)
                .fetch_one(&mut *conn)
                .await;
            match result {
                Ok(true) => {}
                Ok(false) => {
                    warn!(key = %self.key, "Advisory lock was not held at release");
                }
                Err(e) => {
                    warn!(error = %e, key = %self.key, "Failed to release advisory lock, closing connection");
                    // 关闭连接让服务端回收锁，而不是把持锁连接还给池
                    if let Err(e) = conn.detach().close().await {
                        warn!(error = %e, "Failed to close lock connection");
                    }
                }
            }
        }
    }
}

impl Drop for PgLockGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // 未显式释放：脱离连接池，连接关闭时服务端释放锁
            warn!(key = %self.key, "Lock guard dropped without release, detaching connection");
            drop(conn.detach());
        }
    }
}
