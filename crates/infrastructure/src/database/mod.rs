pub mod mapping;
pub mod sqlite;

pub use mapping::MappingHelpers;
pub use sqlite::SqliteTaskStore;

use std::sync::Arc;
use taskline_config::{StoreBackend, StoreConfig};
use taskline_domain::TaskStore;
use taskline_errors::SchedulerResult;
use tracing::info;

use crate::in_memory_store::InMemoryTaskStore;

/// 按配置创建任务存储
pub async fn create_task_store(config: &StoreConfig) -> SchedulerResult<Arc<dyn TaskStore>> {
    match config.backend {
        StoreBackend::Sqlite => Ok(Arc::new(SqliteTaskStore::connect(config).await?)),
        StoreBackend::Memory => {
            info!("使用内存任务存储，进程退出后数据不会保留");
            Ok(Arc::new(InMemoryTaskStore::new()))
        }
    }
}
