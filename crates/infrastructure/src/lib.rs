pub mod cache;
pub mod database;
pub mod error_handling;
pub mod in_memory_store;
pub mod repository;

pub use cache::{CacheStats, TaskCache};
pub use database::{create_task_store, MappingHelpers, SqliteTaskStore};
pub use in_memory_store::InMemoryTaskStore;
pub use repository::TaskRepository;
