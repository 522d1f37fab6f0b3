use thiserror::Error;

/// 调度引擎错误类型定义
///
/// 按影响范围分为两类：
/// - 任务级错误（校验、处理器执行、状态流转、并发冲突），只影响单个任务
/// - 控制面错误（存储、配置、状态），由调用方或宿主进程处理
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("任务描述校验失败: {0}")]
    Validation(String),

    #[error("存储操作失败: {0}")]
    Store(String),

    #[error("任务 {task_id} 处理器执行失败: {message}")]
    HandlerExecution { task_id: String, message: String },

    #[error("未注册的任务类型处理器: {task_type}")]
    HandlerNotFound { task_type: String },

    #[error("任务 {task_id} 执行超时 ({timeout_ms}ms)")]
    ExecutionTimeout { task_id: String, timeout_ms: u64 },

    #[error("任务 {task_id} 非法状态流转: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("任务 {task_id} 并发冲突: 期望状态 {expected}")]
    ConcurrencyConflict { task_id: String, expected: String },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("调度器状态错误: {0}")]
    InvalidState(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn handler_execution<S: Into<String>, M: Into<String>>(task_id: S, message: M) -> Self {
        Self::HandlerExecution {
            task_id: task_id.into(),
            message: message.into(),
        }
    }
    pub fn concurrency_conflict<S: Into<String>, E: Into<String>>(task_id: S, expected: E) -> Self {
        Self::ConcurrencyConflict {
            task_id: task_id.into(),
            expected: expected.into(),
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// 控制面错误：宿主进程应当终止或重新初始化
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Configuration(_) | SchedulerError::Internal(_)
        )
    }

    /// 下一个调度周期可以自然恢复的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Store(_)
                | SchedulerError::ConcurrencyConflict { .. }
                | SchedulerError::HandlerExecution { .. }
                | SchedulerError::ExecutionTimeout { .. }
        )
    }

    /// 只影响单个任务、不应中断调度循环的错误
    pub fn is_task_scoped(&self) -> bool {
        matches!(
            self,
            SchedulerError::Validation(_)
                | SchedulerError::HandlerExecution { .. }
                | SchedulerError::HandlerNotFound { .. }
                | SchedulerError::ExecutionTimeout { .. }
                | SchedulerError::InvalidTransition { .. }
                | SchedulerError::ConcurrencyConflict { .. }
                | SchedulerError::TaskNotFound { .. }
        )
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        SchedulerError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
