use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{DispatcherConfig, ObservabilityConfig, RepositoryConfig, StoreConfig};
use crate::validation::ConfigValidator;

/// 未显式指定配置文件时依次查找的位置
const DEFAULT_CONFIG_PATHS: [&str; 2] = ["config/taskline.toml", "taskline.toml"];

/// 环境变量前缀，例如 `TASKLINE_DISPATCHER__MAX_CONCURRENT_TASKS=8`
pub const ENV_PREFIX: &str = "TASKLINE";

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub dispatcher: DispatcherConfig,
    pub repository: RepositoryConfig,
    pub observability: ObservabilityConfig,
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.store.validate()?;
        self.dispatcher.validate()?;
        self.repository.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

impl AppConfig {
    /// 按 默认值 < 配置文件 < 环境变量 的优先级加载配置
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults =
            ConfigBuilder::try_from(&AppConfig::default()).context("生成默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate().context("配置校验失败")?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate().context("配置校验失败")?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LogFormat, StoreBackend};
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.dispatcher.max_concurrent_tasks, 4);
    }

    #[test]
    fn test_from_toml_partial() {
        let toml_str = r#"
[store]
backend = "memory"

[dispatcher]
scheduling_interval_ms = 250
max_concurrent_tasks = 2

[dispatcher.retry]
base_delay_ms = 50

[observability]
log_format = "json"
"#;
        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.dispatcher.scheduling_interval_ms, 250);
        assert_eq!(config.dispatcher.max_concurrent_tasks, 2);
        assert_eq!(config.dispatcher.retry.base_delay_ms, 50);
        assert_eq!(config.dispatcher.retry.max_delay_ms, 300_000);
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        let toml_str = r#"
[dispatcher]
max_concurrent_tasks = 0
"#;
        assert!(AppConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = AppConfig::default();
        config.dispatcher.recover_stale_after_ms = Some(60_000);
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.dispatcher, config.dispatcher);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[store]\nurl = \"sqlite:/tmp/taskline-test.db\"\n\n[dispatcher]\npage_size = 7"
        )
        .unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.store.url, "sqlite:/tmp/taskline-test.db");
        assert_eq!(config.dispatcher.page_size, 7);
        assert_eq!(config.repository.cache_capacity, 1024);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(AppConfig::load(Some("/nonexistent/taskline.toml")).is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("TASKLINE_REPOSITORY__CACHE_TTL_MS", "1234");
        let config = AppConfig::load(None).unwrap();
        std::env::remove_var("TASKLINE_REPOSITORY__CACHE_TTL_MS");
        assert_eq!(config.repository.cache_ttl_ms, 1234);
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let shipped = AppConfig::from_toml(include_str!("../../../../config/taskline.toml")).unwrap();
        let defaults = AppConfig::default();
        assert_eq!(shipped.dispatcher, defaults.dispatcher);
        assert_eq!(shipped.store.url, defaults.store.url);
        assert_eq!(shipped.observability.log_format, LogFormat::Pretty);
    }
}
