//! obx-postgres - PostgreSQL 适配器
//!
//! 用 sqlx 实现消息存储与 advisory 分区锁。行锁用
//! `FOR UPDATE NOWAIT` 而不是 `SKIP LOCKED`：保证分区内顺序，
//! 锁冲突时快速失败为一个空批次。

mod connection;
mod lock;
mod migration;
mod store;

pub use connection::*;
pub use lock::*;
pub use migration::*;
pub use store::*;
