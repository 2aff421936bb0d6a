//! 并发调度器
//!
//! 固定大小的分区 worker 池 + 一个触发消费任务，通过两个有界
//! 队列协调：小的触发队列合并重扫信号，分区工作队列保存等待
//! worker 的分区键。两个队列满时都丢弃写入。被丢弃的分区键
//! 不是丢失的工作，下一次周期重扫会重新发现它。
//!
//! worker 之间除队列外的全部协调都走分布式锁：worker 从不共享
//! 事务或连接，同一分区绝不会被两个 worker 同时处理。

use std::sync::Arc;

use obx_ports::{LockGuard, LockKey, LockProvider, MessageKind, MessageStore, ProcessingObserver};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ProcessorConfig;
use crate::processor::{BatchProcessor, BatchResult};

/// 触发句柄：向调度器投递一个「请重扫」信号
///
/// 非阻塞、永不出错：触发队列满时信号被合并丢弃。
#[derive(Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<()>,
}

impl TriggerHandle {
    /// 请求一次带外处理
    pub fn fire(&self) {
        let _ = self.tx.try_send(());
    }
}

/// 并发调度器
pub struct Scheduler<S: MessageStore, L: LockProvider> {
    store: Arc<S>,
    locks: Arc<L>,
    processor: Arc<BatchProcessor<S>>,
    kind: MessageKind,
    config: ProcessorConfig,
    observer: Arc<dyn ProcessingObserver>,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    work_tx: mpsc::Sender<String>,
    work_rx: std::sync::Mutex<Option<mpsc::Receiver<String>>>,
}

impl<S: MessageStore, L: LockProvider> Scheduler<S, L> {
    pub fn new(
        store: Arc<S>,
        locks: Arc<L>,
        processor: Arc<BatchProcessor<S>>,
        kind: MessageKind,
        config: ProcessorConfig,
        observer: Arc<dyn ProcessingObserver>,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(config.trigger_queue_capacity);
        let (work_tx, work_rx) = mpsc::channel(config.work_queue_capacity);

        Self {
            store,
            locks,
            processor,
            kind,
            config,
            observer,
            trigger_tx,
            trigger_rx: std::sync::Mutex::new(Some(trigger_rx)),
            work_tx,
            work_rx: std::sync::Mutex::new(Some(work_rx)),
        }
    }

    /// 获取触发句柄
    pub fn trigger_handle(&self) -> TriggerHandle {
        TriggerHandle {
            tx: self.trigger_tx.clone(),
        }
    }

    /// 启动后台任务：N 个分区 worker、触发消费者、周期触发器
    ///
    /// 返回的句柄在所有任务随 `shutdown` 停止后完成。
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let trigger_rx = self
            .trigger_rx
            .lock()
            .expect("scheduler state poisoned")
            .take()
            .expect("scheduler can only be started once");
        let work_rx = self
            .work_rx
            .lock()
            .expect("scheduler state poisoned")
            .take()
            .expect("scheduler can only be started once");

        info!(
            kind = %self.kind,
            workers = self.config.worker_count,
            batch_size = self.config.batch_size,
            "Starting outbox scheduler"
        );

        let mut handles = Vec::new();

        // 分区 worker 池，共享同一个工作队列接收端
        let shared_rx = Arc::new(Mutex::new(work_rx));
        for worker_id in 0..self.config.worker_count {
            let scheduler = self.clone();
            let rx = shared_rx.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                scheduler.run_worker(worker_id, rx, token).await;
            }));
        }

        // 触发消费者
        {
            let scheduler = self.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                scheduler.run_trigger_consumer(trigger_rx, token).await;
            }));
        }

        // 周期触发器
        {
            let scheduler = self.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                scheduler.run_ticker(token).await;
            }));
        }

        let kind = self.kind;
        tokio::spawn(async move {
            futures::future::join_all(handles).await;
            info!(kind = %kind, "Outbox scheduler stopped");
        })
    }

    async fn run_worker(
        &self,
        worker_id: usize,
        work_rx: Arc<Mutex<mpsc::Receiver<String>>>,
        shutdown: CancellationToken,
    ) {
        loop {
            // 只在取键期间持有接收端：处理时释放，让其他 worker 取键
            let key = {
                let mut rx = work_rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    key = rx.recv() => key,
                }
            };
            let Some(key) = key else { break };

            self.handle_partition(&key, &shutdown).await;
        }
        debug!(worker_id, kind = %self.kind, "Partition worker stopped");
    }

    /// 锁定并处理一个分区
    ///
    /// 所有错误都在这里消化：worker 循环绝不能因单次失败退出，
    /// 否则有效池容量会永久缩小。
    async fn handle_partition(&self, partition_key: &str, shutdown: &CancellationToken) {
        let lock_key = LockKey::new(self.kind, partition_key);
        let guard = match self.locks.try_acquire(&lock_key).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                // 其他 worker 或实例正在处理该分区，跳过
                debug!(lock_key = %lock_key, "Partition lock held elsewhere, skipping");
                return;
            }
            Err(e) => {
                error!(lock_key = %lock_key, error = %e, "Failed to acquire partition lock");
                return;
            }
        };

        self.observer.partition_started(partition_key);

        // 取消时丢弃进行中的 future：事务随句柄 drop 回滚，
        // 锁守卫在同一退出路径上释放
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = self.processor.process_partition(partition_key) => Some(result),
        };
        guard.release().await;

        match outcome {
            None => {
                debug!(partition_key, "Batch cancelled mid-flight, transaction rolled back");
            }
            Some(Ok(BatchResult::MorePending)) => {
                // 立即重新入队，持续排空热分区
                if self.work_tx.try_send(partition_key.to_string()).is_err() {
                    debug!(partition_key, "Work queue full, partition deferred to next rescan");
                }
                self.observer.partition_completed(partition_key, false);
            }
            Some(Ok(BatchResult::Drained)) => {
                self.observer.partition_completed(partition_key, true);
            }
            Some(Err(e)) => {
                error!(
                    partition_key,
                    kind = %self.kind,
                    error = %e,
                    "Error processing partition"
                );
                self.observer.partition_completed(partition_key, false);
            }
        }
    }

    async fn run_trigger_consumer(
        &self,
        mut trigger_rx: mpsc::Receiver<()>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                trigger = trigger_rx.recv() => {
                    if trigger.is_none() {
                        break;
                    }
                    self.rescan().await;
                }
            }
        }
        debug!(kind = %self.kind, "Trigger consumer stopped");
    }

    /// 重扫：发现有待处理消息的分区并入队
    async fn rescan(&self) {
        match self.store.list_pending_partitions(self.kind).await {
            Ok(partitions) if partitions.is_empty() => {
                debug!(kind = %self.kind, "No pending partitions");
                self.observer.run_idle();
            }
            Ok(partitions) => {
                debug!(
                    kind = %self.kind,
                    count = partitions.len(),
                    "Enqueueing pending partitions"
                );
                for partition in partitions {
                    if self.work_tx.try_send(partition).is_err() {
                        // 队列满：丢弃，下一次重扫会重新发现
                        debug!(kind = %self.kind, "Work queue full, dropping partition key");
                    }
                }
            }
            Err(e) => {
                error!(kind = %self.kind, error = %e, "Failed to list pending partitions");
            }
        }
    }

    async fn run_ticker(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.rescan_interval());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = self.trigger_tx.try_send(());
                }
            }
        }
        debug!(kind = %self.kind, "Periodic trigger stopped");
    }
}
