//! obx-core - Outbox/Inbox 处理引擎
//!
//! 核心流程：调用方在业务事务内写入消息行，提交后由后台调度器
//! 发现有待处理消息的分区，worker 取得分区锁后在单个事务内认领
//! 一批消息，逐条在 savepoint 内分发给处理器，成功的批量标记、
//! 随事务一次性提交。
//!
//! 三条并发防线：
//! 1. advisory 分区锁：跨实例互斥；
//! 2. `FOR UPDATE NOWAIT` 行锁：锁层被绕过时快速失败而不是死锁；
//! 3. 消息级 savepoint：单条失败不污染同批次的已成功消息。

mod config;
mod dispatcher;
mod engine;
mod facade;
mod policy;
mod processor;
mod scheduler;

pub use config::{ProcessorConfig, load_config};
pub use dispatcher::{DispatchOutcome, HandlerRegistry};
pub use engine::Engine;
pub use facade::{Inbox, Outbox};
pub use policy::{
    BatchFlow, DiscardOnErrorPolicy, DispatchFailure, ErrorDirective, ErrorPolicy, PolicyChain,
    PolicyOutcome, RetryOnErrorPolicy,
};
pub use processor::{BatchProcessor, BatchResult};
pub use scheduler::{Scheduler, TriggerHandle};
