#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskline_config::{DispatcherConfig, RetryConfig};
use taskline_dispatcher::{FailureObserver, HandlerRegistry, TaskContext, TaskDispatcher};
use taskline_domain::{Task, TaskId, TaskStore};
use taskline_infrastructure::{InMemoryTaskStore, TaskRepository};
use taskline_testing_utils::ExecutionTracker;

pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub fn fast_config(max_concurrent_tasks: usize) -> DispatcherConfig {
    DispatcherConfig {
        scheduling_interval_ms: 20,
        max_concurrent_tasks,
        page_size: 100,
        recover_stale_after_ms: None,
        retry: RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 1,
            jitter_factor: 0.0,
        },
    }
}

pub fn dispatcher_over(store: Arc<dyn TaskStore>) -> TaskDispatcher {
    let repository = Arc::new(TaskRepository::new(store));
    TaskDispatcher::new(repository, Arc::new(HandlerRegistry::new()))
}

pub async fn initialized(max_concurrent_tasks: usize) -> TaskDispatcher {
    let dispatcher = dispatcher_over(Arc::new(InMemoryTaskStore::new()));
    dispatcher
        .initialize(fast_config(max_concurrent_tasks))
        .await
        .unwrap();
    dispatcher
}

/// 注册一个记录执行顺序的处理器，每次执行耗时 `work`
pub async fn register_tracked(
    dispatcher: &TaskDispatcher,
    task_type: &str,
    tracker: Arc<ExecutionTracker>,
    work: Duration,
) {
    dispatcher
        .registry()
        .register_fn(task_type, move |ctx: TaskContext| {
            let tracker = tracker.clone();
            async move {
                let _guard = tracker.enter(ctx.name.clone());
                tokio::time::sleep(work).await;
                Ok::<_, anyhow::Error>(None)
            }
        })
        .await;
}

pub async fn register_failing(dispatcher: &TaskDispatcher, task_type: &str) {
    dispatcher
        .registry()
        .register_fn(task_type, |_ctx: TaskContext| async move {
            Err::<Option<serde_json::Value>, _>(anyhow::anyhow!("downstream unavailable"))
        })
        .await;
}

/// 执行一个调度周期并等待派发的任务全部结束
pub async fn tick_and_drain(dispatcher: &TaskDispatcher) -> taskline_dispatcher::TickReport {
    let report = dispatcher.run_tick().await.unwrap();
    assert!(dispatcher.wait_idle(DRAIN_TIMEOUT).await, "executions did not drain");
    report
}

pub async fn reload(dispatcher: &TaskDispatcher, id: &TaskId) -> Task {
    dispatcher
        .repository()
        .get_fresh(id)
        .await
        .unwrap()
        .expect("task exists")
}

#[derive(Default)]
pub struct RecordingObserver {
    failures: Mutex<Vec<(TaskId, String)>>,
}

impl RecordingObserver {
    pub fn failures(&self) -> Vec<(TaskId, String)> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl FailureObserver for RecordingObserver {
    async fn on_task_failed(&self, task: &Task, error: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((task.id, error.to_string()));
    }
}

pub struct PanickingObserver;

#[async_trait]
impl FailureObserver for PanickingObserver {
    async fn on_task_failed(&self, _task: &Task, _error: &str) {
        panic!("observer failure must not reach the dispatcher");
    }
}
