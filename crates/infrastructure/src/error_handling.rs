//! 存储操作的错误上下文
//!
//! 为存储层错误补充操作类型和任务信息，并统一记录日志。

use chrono::{DateTime, Utc};
use sqlx::Error as SqlxError;
use std::fmt;
use taskline_errors::SchedulerError;
use tracing::{debug, error, instrument, warn};

#[derive(Debug, Clone, Copy)]
pub enum RepositoryOperation {
    Create,
    Read,
    Query,
    Update,
    ConditionalUpdate,
    Delete,
    ConditionalDelete,
    Migrate,
    HealthCheck,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryOperation::Create => write!(f, "创建"),
            RepositoryOperation::Read => write!(f, "查询"),
            RepositoryOperation::Query => write!(f, "条件查询"),
            RepositoryOperation::Update => write!(f, "更新"),
            RepositoryOperation::ConditionalUpdate => write!(f, "条件更新"),
            RepositoryOperation::Delete => write!(f, "删除"),
            RepositoryOperation::ConditionalDelete => write!(f, "条件删除"),
            RepositoryOperation::Migrate => write!(f, "迁移"),
            RepositoryOperation::HealthCheck => write!(f, "健康检查"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskOperationContext {
    pub operation: RepositoryOperation,
    pub task_id: Option<String>,
    pub task_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub additional_info: Option<String>,
}

impl TaskOperationContext {
    pub fn new(operation: RepositoryOperation) -> Self {
        Self {
            operation,
            task_id: None,
            task_name: None,
            timestamp: Utc::now(),
            additional_info: None,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_task_name(mut self, task_name: impl Into<String>) -> Self {
        self.task_name = Some(task_name.into());
        self
    }

    pub fn with_additional_info(mut self, info: impl Into<String>) -> Self {
        self.additional_info = Some(info.into());
        self
    }

    pub fn entity_description(&self) -> String {
        match (&self.task_id, &self.task_name) {
            (Some(id), Some(name)) => format!("任务 '{name}' (ID: {id})"),
            (Some(id), None) => format!("任务 (ID: {id})"),
            (None, Some(name)) => format!("任务 '{name}'"),
            (None, None) => "任务".to_string(),
        }
    }
}

pub struct RepositoryErrorHelpers;

impl RepositoryErrorHelpers {
    /// 把 sqlx 错误转换为带上下文的存储错误
    #[instrument(skip_all, fields(
        operation = %context.operation,
        task_id = ?context.task_id,
        timestamp = %context.timestamp,
    ))]
    pub fn store_error(context: &TaskOperationContext, error: SqlxError) -> SchedulerError {
        let entity_desc = context.entity_description();
        let operation_desc = context.operation.to_string();

        let error_msg = match &error {
            SqlxError::Database(db_error) => {
                if db_error.is_unique_violation() {
                    format!("{operation_desc}{entity_desc}时发生主键冲突: 任务已存在")
                } else if db_error.is_check_violation() {
                    let msg = format!("{operation_desc}{entity_desc}时违反约束: {db_error}");
                    warn!(error = %error, "{}", msg);
                    return SchedulerError::validation(msg);
                } else {
                    format!("{operation_desc}{entity_desc}时发生数据库错误: {db_error}")
                }
            }
            SqlxError::PoolClosed => format!("{operation_desc}{entity_desc}时数据库连接池已关闭"),
            SqlxError::PoolTimedOut => format!("{operation_desc}{entity_desc}时数据库连接池超时"),
            SqlxError::Io(io_error) => {
                format!("{operation_desc}{entity_desc}时发生I/O错误: {io_error}")
            }
            _ => format!("{operation_desc}{entity_desc}时发生未知数据库错误: {error}"),
        };

        match &context.additional_info {
            Some(info) => error!(error = %error, info = %info, "{}", error_msg),
            None => error!(error = %error, "{}", error_msg),
        }
        SchedulerError::store(error_msg)
    }

    pub fn serialization_error(
        context: &TaskOperationContext,
        error: impl fmt::Display,
    ) -> SchedulerError {
        let error_msg = format!(
            "{}{}时序列化失败: {}",
            context.operation,
            context.entity_description(),
            error
        );
        error!("{}", error_msg);
        SchedulerError::Serialization(error_msg)
    }

    pub fn task_not_found(context: &TaskOperationContext) -> SchedulerError {
        let entity_desc = context.entity_description();
        warn!("{}{}时未找到记录", context.operation, entity_desc);
        SchedulerError::task_not_found(context.task_id.clone().unwrap_or_default())
    }

    pub fn concurrency_conflict(context: &TaskOperationContext, expected: &str) -> SchedulerError {
        debug!(
            "{}{}时状态已变化，期望状态 {}",
            context.operation,
            context.entity_description(),
            expected
        );
        SchedulerError::concurrency_conflict(context.task_id.clone().unwrap_or_default(), expected)
    }

    pub fn log_operation_success(context: &TaskOperationContext, additional_info: Option<&str>) {
        let base_msg = format!("{}{}成功", context.operation, context.entity_description());
        match additional_info {
            Some(info) => debug!("{}: {}", base_msg, info),
            None => debug!("{}", base_msg),
        }
    }
}

#[macro_export]
macro_rules! task_context {
    ($operation:expr) => {
        $crate::error_handling::TaskOperationContext::new($operation)
    };
    ($operation:expr, task_id = $task_id:expr) => {
        $crate::error_handling::TaskOperationContext::new($operation).with_task_id($task_id.to_string())
    };
    ($operation:expr, task_id = $task_id:expr, task_name = $task_name:expr) => {
        $crate::error_handling::TaskOperationContext::new($operation)
            .with_task_id($task_id.to_string())
            .with_task_name($task_name.to_string())
    };
}
