use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 重试退避配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// 基础重试间隔（毫秒）
    pub base_delay_ms: u64,
    /// 最大重试间隔（毫秒）
    pub max_delay_ms: u64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter_factor: 0.1,
        }
    }
}

impl ConfigValidator for RetryConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(crate::ConfigError::Validation(
                "dispatcher.retry.max_delay_ms must be greater than or equal to base_delay_ms"
                    .to_string(),
            ));
        }
        ValidationUtils::validate_ratio(self.jitter_factor, "dispatcher.retry.jitter_factor")?;
        Ok(())
    }
}

/// 调度循环配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    pub scheduling_interval_ms: u64,
    pub max_concurrent_tasks: usize,
    /// 每个调度周期从存储读取的候选任务上限
    pub page_size: usize,
    /// 超过该时长仍处于 RUNNING 的任务在初始化时交给重试管理器，仅适用于单实例部署
    pub recover_stale_after_ms: Option<u64>,
    pub retry: RetryConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            scheduling_interval_ms: 1_000,
            max_concurrent_tasks: 4,
            page_size: 100,
            recover_stale_after_ms: None,
            retry: RetryConfig::default(),
        }
    }
}

impl ConfigValidator for DispatcherConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_interval_ms(
            self.scheduling_interval_ms,
            "dispatcher.scheduling_interval_ms",
        )?;
        ValidationUtils::validate_count(
            self.max_concurrent_tasks,
            "dispatcher.max_concurrent_tasks",
        )?;
        ValidationUtils::validate_count(self.page_size, "dispatcher.page_size")?;
        if let Some(stale) = self.recover_stale_after_ms {
            ValidationUtils::validate_interval_ms(stale, "dispatcher.recover_stale_after_ms")?;
        }
        self.retry.validate()?;
        Ok(())
    }
}
