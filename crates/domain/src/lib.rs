pub mod entities;
pub mod query;
pub mod store;
pub mod task_query_builder;
pub mod value_objects;

pub use entities::*;
pub use query::*;
pub use store::*;
pub use task_query_builder::{TaskQueryBuilder, TaskQueryParam, TASK_COLUMNS};
pub use taskline_errors::{SchedulerError, SchedulerResult};
pub use value_objects::*;
