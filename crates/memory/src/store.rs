//! 内存消息存储
//!
//! 事务把写操作缓冲为操作日志，提交时在一个锁区间内原子应用。
//! savepoint 是日志上的命名截断点，回滚到 savepoint 只丢弃其后的
//! 操作。id 由序列在插入时立即分配，回滚不回收（与 Postgres 序列
//! 语义一致）。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obx_errors::{OutboxError, OutboxResult};
use obx_ports::{Message, MessageKind, MessageStore, NewMessage};
use uuid::Uuid;

#[derive(Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, Message>,
    /// 已提交与未提交插入共同占用的 event_id 空间
    reserved_event_ids: HashSet<Uuid>,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<MessageKind, Table>,
    /// 处理器侧效应的演示存储，随事务一同提交/回滚
    kv: HashMap<String, String>,
    /// 正被某个事务认领（行锁）的分区
    locked_partitions: HashSet<(MessageKind, String)>,
}

impl Inner {
    fn table(&mut self, kind: MessageKind) -> &mut Table {
        self.tables.entry(kind).or_default()
    }
}

#[derive(Debug, Clone)]
enum Op {
    Insert {
        kind: MessageKind,
        row: Message,
    },
    MarkProcessed {
        kind: MessageKind,
        ids: Vec<i64>,
        at: DateTime<Utc>,
    },
    IncrementRetry {
        kind: MessageKind,
        id: i64,
    },
    Delete {
        kind: MessageKind,
        id: i64,
    },
    Put {
        key: String,
        value: String,
    },
}

/// 内存事务句柄
pub struct MemoryTx {
    inner: Arc<Mutex<Inner>>,
    active: bool,
    ops: Vec<Op>,
    /// (名称, 创建时的日志长度)
    savepoints: Vec<(String, usize)>,
    claims: Vec<(MessageKind, String)>,
}

impl MemoryTx {
    /// 缓冲一个处理器侧效应写入（仅测试辅助）
    ///
    /// 与真实处理器通过事务执行 SQL 等价：提交随批次生效，
    /// 回滚到 savepoint 时被撤销。
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.ops.push(Op::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    fn cleanup(&mut self) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        for op in &self.ops {
            if let Op::Insert { kind, row } = op {
                inner.table(*kind).reserved_event_ids.remove(&row.event_id);
            }
        }
        for claim in self.claims.drain(..) {
            inner.locked_partitions.remove(&claim);
        }
        self.ops.clear();
        self.active = false;
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        // 未显式提交/回滚的事务视为回滚（worker 被取消时的退出路径）
        if self.active {
            self.cleanup();
        }
    }
}

/// 内存消息存储
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 构造一个没有打开事务的句柄，用于验证 `NoActiveTransaction`
    pub fn detached_tx(&self) -> MemoryTx {
        MemoryTx {
            inner: self.inner.clone(),
            active: false,
            ops: Vec::new(),
            savepoints: Vec::new(),
            claims: Vec::new(),
        }
    }

    /// 读取已提交的消息行
    pub fn message(&self, kind: MessageKind, id: i64) -> Option<Message> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.table(kind).rows.get(&id).cloned()
    }

    /// 按 id 升序读取某个表的全部已提交消息
    pub fn messages(&self, kind: MessageKind) -> Vec<Message> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.table(kind).rows.values().cloned().collect()
    }

    /// 待处理消息数
    pub fn pending_count(&self, kind: MessageKind) -> usize {
        self.messages(kind)
            .iter()
            .filter(|m| m.is_pending())
            .count()
    }

    /// 读取已提交的处理器侧效应
    pub fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.kv.get(key).cloned()
    }

    fn gate(tx: &MemoryTx) -> OutboxResult<()> {
        if tx.active {
            Ok(())
        } else {
            Err(OutboxError::NoActiveTransaction)
        }
    }

    fn apply(inner: &mut Inner, op: Op) {
        match op {
            Op::Insert { kind, row } => {
                inner.table(kind).rows.insert(row.id, row);
            }
            Op::MarkProcessed { kind, ids, at } => {
                let table = inner.table(kind);
                for id in ids {
                    if let Some(row) = table.rows.get_mut(&id) {
                        // processed_at 只设置一次，永不回退
                        if row.processed_at.is_none() {
                            row.processed_at = Some(at);
                        }
                    }
                }
            }
            Op::IncrementRetry { kind, id } => {
                if let Some(row) = inner.table(kind).rows.get_mut(&id) {
                    row.retry_count += 1;
                }
            }
            Op::Delete { kind, id } => {
                let table = inner.table(kind);
                if let Some(row) = table.rows.remove(&id) {
                    // 删除后允许同 event_id 重新插入（与唯一索引语义一致）
                    table.reserved_event_ids.remove(&row.event_id);
                }
            }
            Op::Put { key, value } => {
                inner.kv.insert(key, value);
            }
        }
    }

    fn truncate_ops(tx: &mut MemoryTx, len: usize) {
        let mut inner = tx.inner.lock().expect("memory store poisoned");
        for op in tx.ops.drain(len..) {
            if let Op::Insert { kind, row } = op {
                inner.table(kind).reserved_event_ids.remove(&row.event_id);
            }
        }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> OutboxResult<MemoryTx> {
        Ok(MemoryTx {
            inner: self.inner.clone(),
            active: true,
            ops: Vec::new(),
            savepoints: Vec::new(),
            claims: Vec::new(),
        })
    }

    async fn commit(&self, mut tx: MemoryTx) -> OutboxResult<()> {
        Self::gate(&tx)?;
        {
            let mut inner = self.inner.lock().expect("memory store poisoned");
            for op in tx.ops.drain(..) {
                Self::apply(&mut inner, op);
            }
            for claim in tx.claims.drain(..) {
                inner.locked_partitions.remove(&claim);
            }
        }
        tx.active = false;
        Ok(())
    }

    async fn rollback(&self, mut tx: MemoryTx) -> OutboxResult<()> {
        Self::gate(&tx)?;
        tx.cleanup();
        Ok(())
    }

    async fn list_pending_partitions(&self, kind: MessageKind) -> OutboxResult<Vec<String>> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let mut seen = HashSet::new();
        let mut partitions = Vec::new();
        for row in inner.table(kind).rows.values() {
            if row.is_pending() && seen.insert(row.partition_key.clone()) {
                partitions.push(row.partition_key.clone());
            }
        }
        Ok(partitions)
    }

    async fn claim_batch(
        &self,
        tx: &mut MemoryTx,
        kind: MessageKind,
        partition_key: &str,
        batch_size: usize,
    ) -> OutboxResult<Vec<Message>> {
        Self::gate(tx)?;
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let claim = (kind, partition_key.to_string());
        if inner.locked_partitions.contains(&claim) && !tx.claims.contains(&claim) {
            // 行锁被其他事务持有：NOWAIT 语义，空批次而不是等待
            return Ok(Vec::new());
        }
        inner.locked_partitions.insert(claim.clone());
        if !tx.claims.contains(&claim) {
            tx.claims.push(claim);
        }
        Ok(inner
            .table(kind)
            .rows
            .values()
            .filter(|m| m.is_pending() && m.partition_key == partition_key)
            .take(batch_size)
            .cloned()
            .collect())
    }

    async fn savepoint(&self, tx: &mut MemoryTx, name: &str) -> OutboxResult<()> {
        Self::gate(tx)?;
        tx.savepoints.push((name.to_string(), tx.ops.len()));
        Ok(())
    }

    async fn release_savepoint(&self, tx: &mut MemoryTx, name: &str) -> OutboxResult<()> {
        Self::gate(tx)?;
        let pos = tx
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| OutboxError::database(format!("No such savepoint: {}", name)))?;
        // RELEASE 同时销毁之后定义的 savepoint，已缓冲的操作保留
        tx.savepoints.truncate(pos);
        Ok(())
    }

    async fn rollback_to_savepoint(&self, tx: &mut MemoryTx, name: &str) -> OutboxResult<()> {
        Self::gate(tx)?;
        let pos = tx
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| OutboxError::database(format!("No such savepoint: {}", name)))?;
        let len = tx.savepoints[pos].1;
        // savepoint 本身保留，之后定义的销毁
        tx.savepoints.truncate(pos + 1);
        Self::truncate_ops(tx, len);
        Ok(())
    }

    async fn mark_processed(
        &self,
        tx: &mut MemoryTx,
        kind: MessageKind,
        ids: &[i64],
    ) -> OutboxResult<()> {
        Self::gate(tx)?;
        tx.ops.push(Op::MarkProcessed {
            kind,
            ids: ids.to_vec(),
            at: Utc::now(),
        });
        Ok(())
    }

    async fn increment_retry(
        &self,
        tx: &mut MemoryTx,
        kind: MessageKind,
        id: i64,
    ) -> OutboxResult<()> {
        Self::gate(tx)?;
        tx.ops.push(Op::IncrementRetry { kind, id });
        Ok(())
    }

    async fn delete_message(
        &self,
        tx: &mut MemoryTx,
        kind: MessageKind,
        id: i64,
    ) -> OutboxResult<()> {
        Self::gate(tx)?;
        tx.ops.push(Op::Delete { kind, id });
        Ok(())
    }

    async fn insert_message(
        &self,
        tx: &mut MemoryTx,
        kind: MessageKind,
        message: &NewMessage,
    ) -> OutboxResult<()> {
        Self::gate(tx)?;
        let row = {
            let mut inner = self.inner.lock().expect("memory store poisoned");
            let table = inner.table(kind);
            if table.reserved_event_ids.contains(&message.event_id) {
                return Err(OutboxError::DuplicateEventId(message.event_id));
            }
            table.reserved_event_ids.insert(message.event_id);
            // 序列在插入时推进，回滚不回收
            table.next_id += 1;
            Message {
                id: table.next_id,
                event_id: message.event_id,
                created_at: message.created_at,
                type_tag: message.type_tag.clone(),
                partition_key: message.partition_key.clone(),
                data: message.data.clone(),
                retry_count: 0,
                processed_at: None,
            }
        };
        tx.ops.push(Op::Insert { kind, row });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn msg(tag: &str) -> NewMessage {
        NewMessage::new(Uuid::new_v4(), tag, "{}")
    }

    #[tokio::test]
    async fn test_insert_visible_after_commit_only() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        assert_ok!(
            store
                .insert_message(&mut tx, MessageKind::Outbox, &msg("a"))
                .await
        );
        assert_eq!(store.messages(MessageKind::Outbox).len(), 0);

        store.commit(tx).await.unwrap();
        assert_eq!(store.messages(MessageKind::Outbox).len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_inserts() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let m = msg("a");
        store
            .insert_message(&mut tx, MessageKind::Outbox, &m)
            .await
            .unwrap();
        store.rollback(tx).await.unwrap();

        assert_eq!(store.messages(MessageKind::Outbox).len(), 0);

        // 回滚后同 event_id 可以重新插入
        let mut tx = store.begin().await.unwrap();
        store
            .insert_message(&mut tx, MessageKind::Outbox, &m)
            .await
            .unwrap();
        store.commit(tx).await.unwrap();
        assert_eq!(store.messages(MessageKind::Outbox).len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_event_id_within_transaction() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let m = msg("a");

        store
            .insert_message(&mut tx, MessageKind::Outbox, &m)
            .await
            .unwrap();
        let err = store
            .insert_message(&mut tx, MessageKind::Outbox, &m)
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::DuplicateEventId(id) if id == m.event_id));

        // 吞掉错误继续提交：只有一行
        store.commit(tx).await.unwrap();
        assert_eq!(store.messages(MessageKind::Outbox).len(), 1);
    }

    #[tokio::test]
    async fn test_detached_tx_has_no_active_transaction() {
        let store = MemoryStore::new();
        let mut tx = store.detached_tx();

        let err = store
            .insert_message(&mut tx, MessageKind::Outbox, &msg("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::NoActiveTransaction));
    }

    #[tokio::test]
    async fn test_savepoint_rollback_undoes_only_later_ops() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        tx.put("before", "1");
        store.savepoint(&mut tx, "sp1").await.unwrap();
        tx.put("after", "2");
        store.rollback_to_savepoint(&mut tx, "sp1").await.unwrap();

        // savepoint 本身保留，可以再次回滚到它
        tx.put("after2", "3");
        store.rollback_to_savepoint(&mut tx, "sp1").await.unwrap();

        store.commit(tx).await.unwrap();
        assert_eq!(store.get("before").as_deref(), Some("1"));
        assert_eq!(store.get("after"), None);
        assert_eq!(store.get("after2"), None);
    }

    #[tokio::test]
    async fn test_unknown_savepoint_is_error() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let err = store
            .rollback_to_savepoint(&mut tx, "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::Database(_)));
    }

    #[tokio::test]
    async fn test_claim_conflict_yields_empty_batch() {
        let store = MemoryStore::new();
        let mut setup = store.begin().await.unwrap();
        store
            .insert_message(&mut setup, MessageKind::Outbox, &msg("a"))
            .await
            .unwrap();
        store.commit(setup).await.unwrap();

        let mut tx1 = store.begin().await.unwrap();
        let batch = store
            .claim_batch(&mut tx1, MessageKind::Outbox, "default", 10)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);

        // 第二个事务对同一分区拿不到行锁
        let mut tx2 = store.begin().await.unwrap();
        let batch = store
            .claim_batch(&mut tx2, MessageKind::Outbox, "default", 10)
            .await
            .unwrap();
        assert!(batch.is_empty());

        // 提交释放行锁
        store.commit(tx1).await.unwrap();
        let batch = store
            .claim_batch(&mut tx2, MessageKind::Outbox, "default", 10)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        store.rollback(tx2).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_tx_releases_claims() {
        let store = MemoryStore::new();
        let mut setup = store.begin().await.unwrap();
        store
            .insert_message(&mut setup, MessageKind::Inbox, &msg("a"))
            .await
            .unwrap();
        store.commit(setup).await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            let batch = store
                .claim_batch(&mut tx, MessageKind::Inbox, "default", 10)
                .await
                .unwrap();
            assert_eq!(batch.len(), 1);
            // drop 未提交的事务
        }

        let mut tx = store.begin().await.unwrap();
        let batch = store
            .claim_batch(&mut tx, MessageKind::Inbox, "default", 10)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        store.rollback(tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_processed_and_retry() {
        let store = MemoryStore::new();
        let mut setup = store.begin().await.unwrap();
        store
            .insert_message(&mut setup, MessageKind::Outbox, &msg("a"))
            .await
            .unwrap();
        store
            .insert_message(&mut setup, MessageKind::Outbox, &msg("b"))
            .await
            .unwrap();
        store.commit(setup).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        store
            .increment_retry(&mut tx, MessageKind::Outbox, 1)
            .await
            .unwrap();
        store
            .mark_processed(&mut tx, MessageKind::Outbox, &[2])
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let rows = store.messages(MessageKind::Outbox);
        assert_eq!(rows[0].retry_count, 1);
        assert!(rows[0].is_pending());
        assert!(!rows[1].is_pending());
        assert_eq!(store.pending_count(MessageKind::Outbox), 1);
    }

    #[tokio::test]
    async fn test_list_pending_partitions_distinct() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        for partition in ["a", "b", "a"] {
            store
                .insert_message(
                    &mut tx,
                    MessageKind::Outbox,
                    &msg("t").with_partition_key(partition),
                )
                .await
                .unwrap();
        }
        store.commit(tx).await.unwrap();

        let mut partitions = store
            .list_pending_partitions(MessageKind::Outbox)
            .await
            .unwrap();
        partitions.sort();
        assert_eq!(partitions, vec!["a", "b"]);
    }
}
