//! 任务处理器注册表
//!
//! 任务只持久化 `task_type` 和结构化参数，执行时按 `task_type` 在注册表中查找处理器。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use taskline_domain::{Task, TaskId};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// 处理器可见的执行上下文
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub name: String,
    pub task_type: String,
    pub parameters: Value,
    pub metadata: Map<String, Value>,
    /// 已经失败过的次数
    pub retry_attempt: u32,
    pub max_retries: u32,
    pub started_at: DateTime<Utc>,
}

impl TaskContext {
    pub fn from_task(task: &Task, started_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            name: task.name.clone(),
            task_type: task.task_type.clone(),
            parameters: task.parameters.clone(),
            metadata: task.metadata.clone(),
            retry_attempt: task.retry_attempt,
            max_retries: task.max_retries,
            started_at,
        }
    }

    pub fn is_last_attempt(&self) -> bool {
        self.retry_attempt >= self.max_retries
    }
}

/// 生产者提供的任务逻辑
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// 返回值在任务要求保存结果时写入 metadata.result
    async fn handle(&self, context: &TaskContext) -> anyhow::Result<Option<Value>>;
}

/// 闭包处理器
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send,
{
    async fn handle(&self, context: &TaskContext) -> anyhow::Result<Option<Value>> {
        (self.f)(context.clone()).await
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器，同名处理器会被替换
    pub async fn register(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        let mut handlers = self.handlers.write().await;
        if handlers.insert(task_type.clone(), handler).is_some() {
            info!("替换任务处理器: {}", task_type);
        } else {
            debug!("注册任务处理器: {}", task_type);
        }
    }

    pub async fn register_fn<F, Fut>(&self, task_type: impl Into<String>, f: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        self.register(task_type, Arc::new(FnHandler::new(f))).await;
    }

    pub async fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(task_type).cloned()
    }

    pub async fn contains(&self, task_type: &str) -> bool {
        self.handlers.read().await.contains_key(task_type)
    }

    pub async fn unregister(&self, task_type: &str) -> bool {
        self.handlers.write().await.remove(task_type).is_some()
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
