//! 引擎配置
//!
//! 配置是外部输入：引擎只消费，不推导。

use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use obx_errors::{OutboxError, OutboxResult};
use serde::Deserialize;

/// 处理引擎配置
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    /// 单批处理的消息数。整批在一个事务内提交；
    /// 想要每条消息一个事务，设为 1。
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// 并行处理分区的 worker 数
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// 周期性重扫间隔（毫秒）
    #[serde(default = "default_rescan_interval_ms")]
    pub rescan_interval_ms: u64,

    /// 分区工作队列容量。队列满时丢弃溢出的分区键：
    /// 不是丢工作，下一次重扫会重新发现它。
    #[serde(default = "default_work_queue_capacity")]
    pub work_queue_capacity: usize,

    /// 触发队列容量。重复触发被合并，满时静默丢弃。
    #[serde(default = "default_trigger_queue_capacity")]
    pub trigger_queue_capacity: usize,

    /// 消息处理失败（重试路径）时是否中止本批次剩余消息。
    /// `true` 保持分区内顺序；`false` 跳过失败消息继续。
    #[serde(default = "default_stop_batch_on_error")]
    pub stop_batch_on_error: bool,
}

fn default_batch_size() -> usize {
    5
}

fn default_worker_count() -> usize {
    4
}

fn default_rescan_interval_ms() -> u64 {
    4000
}

fn default_work_queue_capacity() -> usize {
    10
}

fn default_trigger_queue_capacity() -> usize {
    1
}

fn default_stop_batch_on_error() -> bool {
    true
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            worker_count: default_worker_count(),
            rescan_interval_ms: default_rescan_interval_ms(),
            work_queue_capacity: default_work_queue_capacity(),
            trigger_queue_capacity: default_trigger_queue_capacity(),
            stop_batch_on_error: default_stop_batch_on_error(),
        }
    }
}

impl ProcessorConfig {
    /// 重扫间隔
    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }

    /// 校验配置
    pub fn validate(&self) -> OutboxResult<()> {
        if self.batch_size == 0 {
            return Err(OutboxError::configuration("batch_size must be at least 1"));
        }
        if self.worker_count == 0 {
            return Err(OutboxError::configuration("worker_count must be at least 1"));
        }
        if self.work_queue_capacity == 0 || self.trigger_queue_capacity == 0 {
            return Err(OutboxError::configuration(
                "queue capacities must be at least 1",
            ));
        }
        Ok(())
    }
}

/// 从 TOML 文件加载配置，环境变量（`OBX_` 前缀）可覆盖
pub fn load_config(path: &str) -> OutboxResult<ProcessorConfig> {
    let config: ProcessorConfig = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("OBX_"))
        .extract()
        .map_err(|e| OutboxError::configuration(format!("Failed to load config: {}", e)))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProcessorConfig::default();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.rescan_interval(), Duration::from_millis(4000));
        assert_eq!(config.work_queue_capacity, 10);
        assert!(config.stop_batch_on_error);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let config = ProcessorConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(OutboxError::Configuration(_))
        ));

        let config = ProcessorConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_figment_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "outbox.toml",
                r#"
                batch_size = 20
                worker_count = 2
                "#,
            )?;
            jail.set_env("OBX_WORKER_COUNT", "8");

            let config = load_config("outbox.toml").expect("config should load");
            assert_eq!(config.batch_size, 20);
            // 环境变量覆盖文件
            assert_eq!(config.worker_count, 8);
            // 未设置的字段取默认值
            assert_eq!(config.rescan_interval_ms, 4000);
            Ok(())
        });
    }
}
