//! 处理过程观察钩子
//!
//! 主要用于测试中检测静默（所有分区处理完毕）与异步流程的同步点。

/// 调度器处理钩子，默认全部空实现
pub trait ProcessingObserver: Send + Sync + 'static {
    /// 某分区的批处理开始（已取得锁）
    fn partition_started(&self, _partition_key: &str) {}

    /// 某分区的批处理结束；`drained` 表示该分区本轮已无剩余
    fn partition_completed(&self, _partition_key: &str, _drained: bool) {}

    /// 一次重扫没有发现任何待处理分区
    fn run_idle(&self) {}
}

/// 缺省观察者
pub struct NoopObserver;

impl ProcessingObserver for NoopObserver {}
