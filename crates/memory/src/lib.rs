//! obx-memory - 内存存储与内存锁
//!
//! 实现与 Postgres 适配器相同的存储契约：事务缓冲写入，savepoint
//! 支持命名回滚点，认领持有分区级行锁（NOWAIT 语义），`event_id`
//! 唯一约束。用于测试与单进程场景。

mod lock;
mod store;

pub use lock::{MemoryLockGuard, MemoryLockProvider};
pub use store::{MemoryStore, MemoryTx};
