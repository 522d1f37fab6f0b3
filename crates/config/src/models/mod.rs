pub mod app_config;
pub mod dispatcher;
pub mod observability;
pub mod store;

pub use app_config::*;
pub use dispatcher::*;
pub use observability::*;
pub use store::*;
