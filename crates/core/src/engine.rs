//! 引擎装配
//!
//! 把存储、锁提供者、处理器注册表与配置装配成一个可启动的
//! 处理引擎。Outbox 与 Inbox 各自装配一个引擎实例。

use std::sync::Arc;

use obx_errors::OutboxResult;
use obx_ports::{LockProvider, MessageKind, MessageStore, NoopObserver, ProcessingObserver};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ProcessorConfig;
use crate::dispatcher::HandlerRegistry;
use crate::policy::PolicyChain;
use crate::processor::BatchProcessor;
use crate::scheduler::{Scheduler, TriggerHandle};

/// 处理引擎
pub struct Engine<S: MessageStore, L: LockProvider> {
    scheduler: Arc<Scheduler<S, L>>,
}

impl<S: MessageStore, L: LockProvider> Engine<S, L> {
    /// 用缺省策略链装配引擎
    pub fn new(
        kind: MessageKind,
        store: Arc<S>,
        locks: Arc<L>,
        registry: Arc<HandlerRegistry<S::Tx>>,
        config: ProcessorConfig,
    ) -> OutboxResult<Self> {
        Self::with_observer(kind, store, locks, registry, config, Arc::new(NoopObserver))
    }

    /// 装配引擎并挂接处理观察钩子
    pub fn with_observer(
        kind: MessageKind,
        store: Arc<S>,
        locks: Arc<L>,
        registry: Arc<HandlerRegistry<S::Tx>>,
        config: ProcessorConfig,
        observer: Arc<dyn ProcessingObserver>,
    ) -> OutboxResult<Self> {
        config.validate()?;

        let processor = Arc::new(BatchProcessor::new(
            store.clone(),
            registry,
            PolicyChain::default_chain(config.stop_batch_on_error),
            kind,
            config.batch_size,
        ));
        let scheduler = Arc::new(Scheduler::new(
            store, locks, processor, kind, config, observer,
        ));

        Ok(Self { scheduler })
    }

    /// 启动后台处理，返回随停止完成的句柄
    pub fn start(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.scheduler.clone().start(shutdown)
    }

    /// 触发句柄，供门面的 `trigger_processing` 使用
    pub fn trigger_handle(&self) -> TriggerHandle {
        self.scheduler.trigger_handle()
    }
}
