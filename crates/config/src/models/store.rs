use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 存储后端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

/// 任务存储连接参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            url: "sqlite:taskline.db".to_string(),
            max_connections: 5,
            min_connections: 1,
            connection_timeout_seconds: 30,
        }
    }
}

impl ConfigValidator for StoreConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.backend == StoreBackend::Memory {
            return Ok(());
        }

        ValidationUtils::validate_not_empty(&self.url, "store.url")?;
        if !self.url.starts_with("sqlite:") {
            return Err(crate::ConfigError::Validation(
                "store.url must start with sqlite:".to_string(),
            ));
        }

        ValidationUtils::validate_count(self.max_connections as usize, "store.max_connections")?;
        ValidationUtils::validate_count(self.min_connections as usize, "store.min_connections")?;

        if self.min_connections > self.max_connections {
            return Err(crate::ConfigError::Validation(
                "store.min_connections must be less than or equal to max_connections".to_string(),
            ));
        }

        ValidationUtils::validate_timeout_seconds(
            self.connection_timeout_seconds,
            "store.connection_timeout_seconds",
        )?;

        Ok(())
    }
}

/// 仓储层读缓存配置，`cache_capacity = 0` 表示关闭缓存
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub cache_capacity: usize,
    pub cache_ttl_ms: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1024,
            cache_ttl_ms: 5_000,
        }
    }
}

impl ConfigValidator for RepositoryConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.cache_capacity > 0 {
            ValidationUtils::validate_interval_ms(self.cache_ttl_ms, "repository.cache_ttl_ms")?;
        }
        Ok(())
    }
}
