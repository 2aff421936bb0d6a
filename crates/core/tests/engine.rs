//! 引擎端到端测试：内存后端 + 完整调度/处理链路

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use obx_core::{Engine, HandlerRegistry, Outbox, ProcessorConfig};
use obx_errors::OutboxError;
use obx_memory::{MemoryLockProvider, MemoryStore, MemoryTx};
use obx_ports::{MessageHandler, MessageKind, MessageMetadata, MessageStore, NewMessage};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 测试日志，`RUST_LOG` 控制级别
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Serialize, Deserialize)]
struct Event {
    seq: i64,
}

/// 记录每个分区的投递顺序，并监视分区内并发度
struct RecordingHandler {
    delivered: Arc<Mutex<HashMap<String, Vec<i64>>>>,
    in_flight: Arc<Mutex<HashMap<String, i64>>>,
    max_overlap: Arc<AtomicI64>,
}

#[async_trait]
impl MessageHandler<MemoryTx> for RecordingHandler {
    type Payload = Event;

    async fn handle(
        &self,
        _tx: &mut MemoryTx,
        payload: Event,
        metadata: &MessageMetadata,
    ) -> anyhow::Result<()> {
        let partition = metadata.partition_key.clone();
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(partition.clone()).or_insert(0);
            *count += 1;
            self.max_overlap.fetch_max(*count, Ordering::SeqCst);
        }

        tokio::time::sleep(Duration::from_millis(1)).await;

        self.delivered
            .lock()
            .unwrap()
            .entry(partition.clone())
            .or_default()
            .push(payload.seq);
        *self.in_flight.lock().unwrap().get_mut(&partition).unwrap() -= 1;
        Ok(())
    }
}

fn fast_config() -> ProcessorConfig {
    ProcessorConfig {
        rescan_interval_ms: 20,
        ..ProcessorConfig::default()
    }
}

async fn seed(store: &MemoryStore, partitions: &[&str], per_partition: i64) {
    let mut tx = store.begin().await.unwrap();
    for seq in 0..per_partition {
        for partition in partitions {
            let msg = NewMessage::from_payload(Uuid::new_v4(), "event", &Event { seq })
                .unwrap()
                .with_partition_key(*partition);
            store
                .insert_message(&mut tx, MessageKind::Outbox, &msg)
                .await
                .unwrap();
        }
    }
    store.commit(tx).await.unwrap();
}

/// 轮询等待所有待处理消息被消费完
async fn wait_drained(store: &MemoryStore, kind: MessageKind) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if store.pending_count(kind) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("messages were not drained in time");
}

#[tokio::test]
async fn test_drains_partitions_in_order_exactly_once() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let delivered = Arc::new(Mutex::new(HashMap::new()));
    let in_flight = Arc::new(Mutex::new(HashMap::new()));
    let max_overlap = Arc::new(AtomicI64::new(0));

    let registry = Arc::new(HandlerRegistry::new().register(
        "event",
        RecordingHandler {
            delivered: delivered.clone(),
            in_flight: in_flight.clone(),
            max_overlap: max_overlap.clone(),
        },
    ));

    let partitions = ["a", "b", "c", "d"];
    seed(&store, &partitions, 50).await;

    let engine = Engine::new(
        MessageKind::Outbox,
        store.clone(),
        Arc::new(MemoryLockProvider::new()),
        registry,
        fast_config(),
    )
    .unwrap();
    let shutdown = CancellationToken::new();
    let handle = engine.start(shutdown.clone());

    wait_drained(&store, MessageKind::Outbox).await;
    shutdown.cancel();
    handle.await.unwrap();

    let delivered = delivered.lock().unwrap();
    for partition in partitions {
        let seqs = &delivered[partition];
        assert_eq!(seqs.len(), 50, "partition {partition} missing deliveries");
        // 分区内严格按 id 升序，且无重复投递
        assert!(
            seqs.windows(2).all(|w| w[0] < w[1]),
            "partition {partition} delivered out of order: {seqs:?}"
        );
    }
    // 同一分区从不并行处理
    assert_eq!(max_overlap.load(Ordering::SeqCst), 1);
}

struct FlakyHandler {
    delivered: Arc<Mutex<Vec<i64>>>,
    fail_seq: i64,
}

#[async_trait]
impl MessageHandler<MemoryTx> for FlakyHandler {
    type Payload = Event;

    async fn handle(
        &self,
        tx: &mut MemoryTx,
        payload: Event,
        _metadata: &MessageMetadata,
    ) -> anyhow::Result<()> {
        tx.put(format!("seen-{}", payload.seq), "1");
        if payload.seq == self.fail_seq {
            return Err(anyhow!("transient failure"));
        }
        self.delivered.lock().unwrap().push(payload.seq);
        Ok(())
    }
}

#[tokio::test]
async fn test_failure_stops_batch_and_rolls_back_side_effects() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let delivered = Arc::new(Mutex::new(Vec::new()));

    let registry = Arc::new(HandlerRegistry::new().register(
        "event",
        FlakyHandler {
            delivered: delivered.clone(),
            fail_seq: 2,
        },
    ));

    seed(&store, &["a"], 5).await;

    let engine = Engine::new(
        MessageKind::Outbox,
        store.clone(),
        Arc::new(MemoryLockProvider::new()),
        registry,
        fast_config(),
    )
    .unwrap();
    let shutdown = CancellationToken::new();
    let handle = engine.start(shutdown.clone());

    // 头两条会成功并提交；seq 2 每轮都失败并中止批次剩余
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if store.pending_count(MessageKind::Outbox) == 3 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("leading messages were not processed");

    // 再让引擎重扫几轮，确认失败消息挡住了后继消息
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(*delivered.lock().unwrap(), vec![0, 1]);
    // 失败消息的事务内写入被 savepoint 撤销，成功消息的保留
    assert_eq!(store.get("seen-0").as_deref(), Some("1"));
    assert_eq!(store.get("seen-1").as_deref(), Some("1"));
    assert_eq!(store.get("seen-2"), None);

    // 失败消息在每轮批次里都会累计重试次数
    let stuck = store
        .messages(MessageKind::Outbox)
        .into_iter()
        .find(|m| m.is_pending())
        .unwrap();
    assert!(stuck.retry_count >= 1);
}

struct PoisonHandler;

#[async_trait]
impl MessageHandler<MemoryTx> for PoisonHandler {
    type Payload = Event;

    async fn handle(
        &self,
        _tx: &mut MemoryTx,
        payload: Event,
        _metadata: &MessageMetadata,
    ) -> anyhow::Result<()> {
        Err(anyhow!("poison message {}", payload.seq))
    }

    fn discard_on(&self, cause: &anyhow::Error) -> bool {
        cause.to_string().contains("poison")
    }
}

#[tokio::test]
async fn test_discarded_messages_do_not_block_partition() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(HandlerRegistry::new().register("event", PoisonHandler));

    seed(&store, &["a"], 5).await;

    let engine = Engine::new(
        MessageKind::Outbox,
        store.clone(),
        Arc::new(MemoryLockProvider::new()),
        registry,
        fast_config(),
    )
    .unwrap();
    let shutdown = CancellationToken::new();
    let handle = engine.start(shutdown.clone());

    wait_drained(&store, MessageKind::Outbox).await;
    shutdown.cancel();
    handle.await.unwrap();

    // 每条都被永久丢弃：表里不再有任何行
    assert!(store.messages(MessageKind::Outbox).is_empty());
}

#[tokio::test]
async fn test_duplicate_event_id_rejected_across_transactions() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(
        MessageKind::Outbox,
        store.clone(),
        Arc::new(MemoryLockProvider::new()),
        Arc::new(HandlerRegistry::<MemoryTx>::new()),
        ProcessorConfig::default(),
    )
    .unwrap();
    let outbox = Outbox::new(store.clone(), engine.trigger_handle());
    let event_id = Uuid::new_v4();

    let mut tx = store.begin().await.unwrap();
    outbox
        .add_message(&mut tx, NewMessage::new(event_id, "event", "{}"))
        .await
        .unwrap();
    store.commit(tx).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let err = outbox
        .add_message(&mut tx, NewMessage::new(event_id, "event", "{}"))
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::DuplicateEventId(id) if id == event_id));
}

#[tokio::test]
async fn test_trigger_drains_without_waiting_for_rescan() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let delivered = Arc::new(Mutex::new(HashMap::new()));
    let registry = Arc::new(HandlerRegistry::new().register(
        "event",
        RecordingHandler {
            delivered: delivered.clone(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            max_overlap: Arc::new(AtomicI64::new(0)),
        },
    ));

    // 重扫间隔拉长，处理只能靠显式触发
    let config = ProcessorConfig {
        rescan_interval_ms: 60_000,
        ..ProcessorConfig::default()
    };
    let engine = Engine::new(
        MessageKind::Outbox,
        store.clone(),
        Arc::new(MemoryLockProvider::new()),
        registry,
        config,
    )
    .unwrap();
    let outbox = Outbox::new(store.clone(), engine.trigger_handle());
    let shutdown = CancellationToken::new();
    let handle = engine.start(shutdown.clone());

    let mut tx = store.begin().await.unwrap();
    outbox
        .add_message(
            &mut tx,
            NewMessage::from_payload(Uuid::new_v4(), "event", &Event { seq: 0 })
                .unwrap()
                .with_partition_key("a"),
        )
        .await
        .unwrap();
    store.commit(tx).await.unwrap();
    outbox.trigger_processing();

    wait_drained(&store, MessageKind::Outbox).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(delivered.lock().unwrap()["a"], vec![0]);
}
