//! 调度引擎核心：调度判定、执行协调、失败重试与调度循环

pub mod coordinator;
pub mod evaluator;
pub mod handler;
pub mod observability;
pub mod observer;
pub mod retry_service;
pub mod scheduler;

pub use coordinator::{ExecutionCoordinator, ExecutionOutcome};
pub use evaluator::ScheduleEvaluator;
pub use handler::{FnHandler, HandlerRegistry, TaskContext, TaskHandler};
pub use observability::MetricsCollector;
pub use observer::{FailureObserver, FailureObservers};
pub use retry_service::TaskRetryService;
pub use scheduler::{SchedulerStatus, TaskDispatcher, TickReport};
