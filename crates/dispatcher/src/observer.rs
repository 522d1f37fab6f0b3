use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use taskline_domain::Task;
use tracing::{debug, warn};

/// 任务最终失败时的通知接收方
#[async_trait]
pub trait FailureObserver: Send + Sync {
    async fn on_task_failed(&self, task: &Task, error: &str);
}

/// 观察者列表；通知在独立的 tokio 任务中进行，观察者的 panic 不会影响调度
#[derive(Default)]
pub struct FailureObservers {
    observers: RwLock<Vec<Arc<dyn FailureObserver>>>,
}

impl FailureObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn FailureObserver>) {
        match self.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, task: &Task, error: &str) {
        let observers = self.snapshot();
        if observers.is_empty() {
            return;
        }
        debug!(task_id = %task.id, "通知 {} 个失败观察者", observers.len());
        for observer in observers {
            let task = task.clone();
            let error = error.to_string();
            let handle = tokio::spawn(async move {
                observer.on_task_failed(&task, &error).await;
            });
            tokio::spawn(async move {
                if let Err(e) = handle.await {
                    warn!("失败观察者执行异常: {}", e);
                }
            });
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn FailureObserver>> {
        match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
