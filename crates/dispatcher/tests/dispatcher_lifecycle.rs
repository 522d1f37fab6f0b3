mod common;

use chrono::Duration as ChronoDuration;
use common::*;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use taskline_config::RepositoryConfig;
use taskline_dispatcher::{HandlerRegistry, TaskContext, TaskDispatcher};
use taskline_domain::{now_millis, NewTask, TaskFilter, TaskPatch, TaskStatus, Transition};
use taskline_errors::SchedulerError;
use taskline_infrastructure::{InMemoryTaskStore, SqliteTaskStore, TaskRepository};
use taskline_testing_utils::{ExecutionTracker, FlakyTaskStore, StoreOperation, TestEnv};

#[tokio::test]
async fn lifecycle_state_errors() {
    let dispatcher = dispatcher_over(Arc::new(InMemoryTaskStore::new()));

    let err = dispatcher.start_scheduler().await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidState(_)));
    assert!(matches!(
        dispatcher.run_tick().await.unwrap_err(),
        SchedulerError::InvalidState(_)
    ));
    assert!(!dispatcher.is_scheduler_running());

    dispatcher.initialize(fast_config(2)).await.unwrap();
    dispatcher.start_scheduler().await.unwrap();
    assert!(dispatcher.is_scheduler_running());

    assert!(matches!(
        dispatcher.start_scheduler().await.unwrap_err(),
        SchedulerError::InvalidState(_)
    ));
    assert!(matches!(
        dispatcher.initialize(fast_config(2)).await.unwrap_err(),
        SchedulerError::InvalidState(_)
    ));

    dispatcher.stop_scheduler().await.unwrap();
    assert!(!dispatcher.is_scheduler_running());
    dispatcher.stop_scheduler().await.unwrap();

    dispatcher.start_scheduler().await.unwrap();
    dispatcher.reset().await.unwrap();
    assert!(!dispatcher.is_scheduler_running());
    assert!(!dispatcher.is_initialized().await);
    assert!(matches!(
        dispatcher.start_scheduler().await.unwrap_err(),
        SchedulerError::InvalidState(_)
    ));

    dispatcher.initialize(fast_config(1)).await.unwrap();
    dispatcher.start_scheduler().await.unwrap();
    dispatcher.stop_scheduler().await.unwrap();
}

#[tokio::test]
async fn initialize_rejects_invalid_config() {
    let dispatcher = dispatcher_over(Arc::new(InMemoryTaskStore::new()));
    let mut config = fast_config(1);
    config.max_concurrent_tasks = 0;

    let err = dispatcher.initialize(config).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Configuration(_)));
    assert!(!dispatcher.is_initialized().await);
}

#[tokio::test]
async fn initialize_surfaces_store_failure() {
    let store = Arc::new(FlakyTaskStore::new(Arc::new(InMemoryTaskStore::new())));
    store.set_unhealthy(true);
    let dispatcher = dispatcher_over(store.clone());

    let err = dispatcher.initialize(fast_config(1)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Store(_)));

    store.set_unhealthy(false);
    dispatcher.initialize(fast_config(1)).await.unwrap();
}

#[tokio::test]
async fn tick_store_errors_do_not_stop_the_loop() {
    let store = Arc::new(FlakyTaskStore::new(Arc::new(InMemoryTaskStore::new())));
    let dispatcher = dispatcher_over(store.clone());
    dispatcher.initialize(fast_config(1)).await.unwrap();
    let tracker = ExecutionTracker::new();
    register_tracked(&dispatcher, "work", tracker.clone(), Duration::from_millis(1)).await;

    let task = dispatcher
        .create_task(NewTask::new("survivor", "work"))
        .await
        .unwrap();

    store.fail_next(StoreOperation::Find, 1);
    assert!(matches!(
        dispatcher.run_tick().await.unwrap_err(),
        SchedulerError::Store(_)
    ));

    store.fail_next(StoreOperation::Find, 3);
    dispatcher.start_scheduler().await.unwrap();
    let completed = TestEnv::wait_for(
        || async { tracker.count() == 1 },
        Duration::from_secs(5),
    )
    .await;
    assert!(dispatcher.wait_idle(DRAIN_TIMEOUT).await);
    dispatcher.stop_scheduler().await.unwrap();

    assert!(completed);
    assert_eq!(store.injected_failures(), 4);
    assert_eq!(reload(&dispatcher, &task.id).await.status, TaskStatus::Completed);
}

/// 处理器执行期间让接下来 `failures` 次条件写入失败
async fn register_sabotage(
    dispatcher: &TaskDispatcher,
    store: Arc<FlakyTaskStore>,
    failures: usize,
    succeed: bool,
) {
    dispatcher
        .registry()
        .register_fn("sabotage", move |_ctx: TaskContext| {
            let store = store.clone();
            async move {
                store.fail_next(StoreOperation::ConditionalUpdate, failures);
                if succeed {
                    Ok(None)
                } else {
                    Err(anyhow::anyhow!("handler gave up"))
                }
            }
        })
        .await;
}

#[tokio::test]
async fn final_persist_is_retried_after_store_error() {
    let store = Arc::new(FlakyTaskStore::new(Arc::new(InMemoryTaskStore::new())));
    let dispatcher = dispatcher_over(store.clone());
    dispatcher.initialize(fast_config(1)).await.unwrap();
    register_sabotage(&dispatcher, store.clone(), 1, true).await;

    let task = dispatcher
        .create_task(NewTask::new("persist", "sabotage"))
        .await
        .unwrap();
    tick_and_drain(&dispatcher).await;

    assert_eq!(store.injected_failures(), 1);
    assert_eq!(reload(&dispatcher, &task.id).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn final_persist_outlasts_repeated_store_errors() {
    let store = Arc::new(FlakyTaskStore::new(Arc::new(InMemoryTaskStore::new())));
    let dispatcher = dispatcher_over(store.clone());
    dispatcher.initialize(fast_config(1)).await.unwrap();
    register_sabotage(&dispatcher, store.clone(), 5, true).await;

    let task = dispatcher
        .create_task(NewTask::new("stubborn", "sabotage"))
        .await
        .unwrap();
    tick_and_drain(&dispatcher).await;

    assert_eq!(store.injected_failures(), 5);
    assert_eq!(dispatcher.in_flight(), 0);
    assert_eq!(reload(&dispatcher, &task.id).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn final_failure_is_persisted_despite_store_errors() {
    let store = Arc::new(FlakyTaskStore::new(Arc::new(InMemoryTaskStore::new())));
    let dispatcher = dispatcher_over(store.clone());
    dispatcher.initialize(fast_config(1)).await.unwrap();
    register_sabotage(&dispatcher, store.clone(), 5, false).await;

    let task = dispatcher
        .create_task(NewTask::new("doomed", "sabotage").with_max_retries(0))
        .await
        .unwrap();
    tick_and_drain(&dispatcher).await;

    assert_eq!(store.injected_failures(), 5);
    let failed = reload(&dispatcher, &task.id).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.last_error.unwrap().contains("handler gave up"));
}

#[tokio::test]
async fn stop_lets_in_flight_tasks_finish() {
    let dispatcher = initialized(2).await;
    let tracker = ExecutionTracker::new();
    register_tracked(&dispatcher, "work", tracker.clone(), Duration::from_millis(150)).await;

    let task = dispatcher
        .create_task(NewTask::new("long", "work"))
        .await
        .unwrap();
    dispatcher.start_scheduler().await.unwrap();
    assert!(TestEnv::wait_for(|| async { tracker.count() == 1 }, Duration::from_secs(5)).await);

    dispatcher.stop_scheduler().await.unwrap();
    assert_eq!(dispatcher.in_flight(), 1);
    assert_eq!(reload(&dispatcher, &task.id).await.status, TaskStatus::Running);

    assert!(dispatcher.wait_idle(DRAIN_TIMEOUT).await);
    assert_eq!(reload(&dispatcher, &task.id).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn cancel_only_applies_to_pending_tasks() {
    let dispatcher = initialized(1).await;
    let tracker = ExecutionTracker::new();
    register_tracked(&dispatcher, "work", tracker.clone(), Duration::from_millis(1)).await;

    let later = dispatcher
        .create_task(NewTask::new("later", "work").at(now_millis() + ChronoDuration::milliseconds(20)))
        .await
        .unwrap();
    let cancelled = dispatcher.cancel_task(&later.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(40)).await;
    let report = tick_and_drain(&dispatcher).await;
    assert_eq!(report.dispatched, 0);
    assert_eq!(tracker.count(), 0);

    let err = dispatcher.cancel_task(&later.id).await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidTransition { .. }));

    let missing = taskline_domain::TaskId::new();
    assert!(matches!(
        dispatcher.cancel_task(&missing).await.unwrap_err(),
        SchedulerError::TaskNotFound { .. }
    ));
}

#[tokio::test]
async fn running_task_cannot_be_deleted() {
    let dispatcher = initialized(1).await;
    let tracker = ExecutionTracker::new();
    register_tracked(&dispatcher, "work", tracker.clone(), Duration::from_millis(200)).await;

    let task = dispatcher
        .create_task(NewTask::new("busy", "work"))
        .await
        .unwrap();
    dispatcher.run_tick().await.unwrap();
    assert!(TestEnv::wait_for(|| async { tracker.count() == 1 }, Duration::from_secs(5)).await);

    let err = dispatcher.delete_task(&task.id).await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidState(_)));

    assert!(dispatcher.wait_idle(DRAIN_TIMEOUT).await);
    assert!(dispatcher.delete_task(&task.id).await.unwrap());
}

#[tokio::test]
async fn delete_racing_a_claim_leaves_the_task_running() {
    let store = Arc::new(FlakyTaskStore::new(Arc::new(InMemoryTaskStore::new())));
    let dispatcher = Arc::new(dispatcher_over(store.clone()));
    dispatcher.initialize(fast_config(1)).await.unwrap();
    let tracker = ExecutionTracker::new();
    register_tracked(&dispatcher, "work", tracker.clone(), Duration::from_millis(100)).await;

    let task = dispatcher
        .create_task(NewTask::new("contested", "work"))
        .await
        .unwrap();

    // 删除读到 PENDING 之后、条件删除之前，调度周期认领了任务
    store.set_latency(StoreOperation::ConditionalDelete, Duration::from_millis(60));
    let deletion = {
        let dispatcher = dispatcher.clone();
        let id = task.id;
        tokio::spawn(async move { dispatcher.delete_task(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(dispatcher.run_tick().await.unwrap().dispatched, 1);

    let err = deletion.await.unwrap().unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidState(_)), "{err}");

    assert!(dispatcher.wait_idle(DRAIN_TIMEOUT).await);
    assert_eq!(tracker.count(), 1);
    assert_eq!(reload(&dispatcher, &task.id).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn reinitialize_keeps_slots_of_unfinished_executions() {
    let dispatcher = initialized(1).await;
    let tracker = ExecutionTracker::new();
    register_tracked(&dispatcher, "work", tracker.clone(), Duration::from_millis(200)).await;

    let first = dispatcher
        .create_task(NewTask::new("first", "work"))
        .await
        .unwrap();
    assert_eq!(dispatcher.run_tick().await.unwrap().dispatched, 1);

    dispatcher.reset().await.unwrap();
    dispatcher.initialize(fast_config(1)).await.unwrap();
    assert_eq!(dispatcher.in_flight(), 1);

    let second = dispatcher
        .create_task(NewTask::new("second", "work"))
        .await
        .unwrap();
    assert_eq!(dispatcher.run_tick().await.unwrap().dispatched, 0);
    assert_eq!(reload(&dispatcher, &second.id).await.status, TaskStatus::Pending);

    assert!(dispatcher.wait_idle(DRAIN_TIMEOUT).await);
    assert_eq!(tick_and_drain(&dispatcher).await.dispatched, 1);

    assert_eq!(tracker.peak(), 1);
    assert_eq!(tracker.started(), vec!["first", "second"]);
    assert_eq!(reload(&dispatcher, &first.id).await.status, TaskStatus::Completed);
    assert_eq!(reload(&dispatcher, &second.id).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn wait_idle_wakes_when_last_execution_ends() {
    let dispatcher = Arc::new(initialized(2).await);
    let gate = Arc::new(Notify::new());
    {
        let gate = gate.clone();
        dispatcher
            .registry()
            .register_fn("gated", move |_ctx: TaskContext| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok::<_, anyhow::Error>(None)
                }
            })
            .await;
    }

    let task = dispatcher
        .create_task(NewTask::new("held", "gated"))
        .await
        .unwrap();
    assert_eq!(dispatcher.run_tick().await.unwrap().dispatched, 1);

    assert!(!dispatcher.wait_idle(Duration::from_millis(20)).await);

    let waiter = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.wait_idle(Duration::from_secs(30)).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());

    gate.notify_one();
    let idle = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("wait_idle should wake on the last completion")
        .unwrap();
    assert!(idle);
    assert_eq!(dispatcher.in_flight(), 0);
    assert_eq!(reload(&dispatcher, &task.id).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn failure_observers_are_notified_once_on_final_failure() {
    let dispatcher = initialized(1).await;
    let observer = Arc::new(RecordingObserver::default());
    dispatcher.register_failure_observer(Arc::new(PanickingObserver));
    dispatcher.register_failure_observer(observer.clone());
    register_failing(&dispatcher, "broken").await;

    let task = dispatcher
        .create_task(NewTask::new("watched", "broken").with_max_retries(1))
        .await
        .unwrap();

    tick_and_drain(&dispatcher).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(observer.failures().is_empty());

    tick_and_drain(&dispatcher).await;
    assert!(TestEnv::wait_for(|| async { observer.failures().len() == 1 }, Duration::from_secs(5)).await);

    let failures = observer.failures();
    assert_eq!(failures[0].0, task.id);
    assert_eq!(failures[0].1, "downstream unavailable");

    // 观察者 panic 之后调度器仍可正常工作
    let tracker = ExecutionTracker::new();
    register_tracked(&dispatcher, "work", tracker.clone(), Duration::from_millis(1)).await;
    dispatcher
        .create_task(NewTask::new("after", "work"))
        .await
        .unwrap();
    tick_and_drain(&dispatcher).await;
    assert_eq!(tracker.count(), 1);
}

#[tokio::test]
async fn missing_handler_is_treated_as_failure() {
    let dispatcher = initialized(1).await;
    let task = dispatcher
        .create_task(NewTask::new("orphan", "nobody-handles-this").with_max_retries(1))
        .await
        .unwrap();

    tick_and_drain(&dispatcher).await;
    let retried = reload(&dispatcher, &task.id).await;
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.retry_attempt, 1);
    assert!(retried
        .last_error
        .unwrap()
        .contains("nobody-handles-this"));
}

#[tokio::test]
async fn handler_receives_parameters_and_result_is_stored() {
    let dispatcher = initialized(1).await;
    dispatcher
        .registry()
        .register_fn("sum", |ctx: TaskContext| async move {
            let values = ctx.parameters["values"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            let total: i64 = values.iter().filter_map(|v| v.as_i64()).sum();
            Ok::<_, anyhow::Error>(Some(json!({ "total": total })))
        })
        .await;

    let stored = dispatcher
        .create_task(
            NewTask::new("with-result", "sum")
                .with_parameters(json!({"values": [1, 2, 3]}))
                .store_result(),
        )
        .await
        .unwrap();
    let discarded = dispatcher
        .create_task(NewTask::new("without-result", "sum").with_parameters(json!({"values": [4]})))
        .await
        .unwrap();

    tick_and_drain(&dispatcher).await;

    let stored = reload(&dispatcher, &stored.id).await;
    assert_eq!(stored.metadata["result"], json!({"total": 6}));
    let discarded = reload(&dispatcher, &discarded.id).await;
    assert_eq!(discarded.status, TaskStatus::Completed);
    assert!(!discarded.metadata.contains_key("result"));
}

#[tokio::test]
async fn interval_task_repeats_while_scheduler_runs() {
    let dispatcher = initialized(1).await;
    let tracker = ExecutionTracker::new();
    register_tracked(&dispatcher, "heartbeat", tracker.clone(), Duration::from_millis(1)).await;

    let task = dispatcher
        .create_task(NewTask::new("heartbeat", "heartbeat").every(30))
        .await
        .unwrap();

    dispatcher.start_scheduler().await.unwrap();
    assert!(TestEnv::wait_for(|| async { tracker.count() >= 3 }, Duration::from_secs(5)).await);
    dispatcher.stop_scheduler().await.unwrap();
    assert!(dispatcher.wait_idle(DRAIN_TIMEOUT).await);

    let current = reload(&dispatcher, &task.id).await;
    assert_eq!(current.status, TaskStatus::Pending);
    assert_eq!(current.retry_attempt, 0);
    assert!(current.last_executed_at.is_some());
}

#[tokio::test]
async fn stale_running_tasks_are_recovered_on_initialize() {
    let store = Arc::new(InMemoryTaskStore::new());
    let repository = Arc::new(TaskRepository::new(store.clone()));

    let stale = repository
        .create(NewTask::new("crashed", "work").with_max_retries(1))
        .await
        .unwrap();
    repository
        .transition(
            &stale,
            Transition::Claim,
            TaskPatch::new().last_executed_at(now_millis() - ChronoDuration::minutes(10)),
        )
        .await
        .unwrap();
    let fresh = repository
        .create(NewTask::new("busy", "work"))
        .await
        .unwrap();
    repository
        .transition(
            &fresh,
            Transition::Claim,
            TaskPatch::new().last_executed_at(now_millis()),
        )
        .await
        .unwrap();

    let dispatcher = TaskDispatcher::new(repository.clone(), Arc::new(HandlerRegistry::new()));
    let mut config = fast_config(1);
    config.recover_stale_after_ms = Some(60_000);
    dispatcher.initialize(config).await.unwrap();

    let recovered = reload(&dispatcher, &stale.id).await;
    assert_eq!(recovered.status, TaskStatus::Pending);
    assert_eq!(recovered.retry_attempt, 1);
    assert!(recovered.last_error.is_some());
    assert_eq!(reload(&dispatcher, &fresh.id).await.status, TaskStatus::Running);
}

#[tokio::test]
async fn status_reports_counts_and_capacity() {
    let dispatcher = initialized(3).await;
    let tracker = ExecutionTracker::new();
    register_tracked(&dispatcher, "work", tracker, Duration::from_millis(1)).await;

    dispatcher
        .create_task(NewTask::new("done", "work"))
        .await
        .unwrap();
    tick_and_drain(&dispatcher).await;
    dispatcher
        .create_task(NewTask::new("waiting", "work").at(now_millis() + ChronoDuration::hours(1)))
        .await
        .unwrap();

    let status = dispatcher.status().await.unwrap();
    assert!(status.initialized);
    assert!(!status.running);
    assert_eq!(status.in_flight, 0);
    assert_eq!(status.max_concurrent_tasks, Some(3));
    assert_eq!(status.counts_by_status.get("COMPLETED"), Some(&1));
    assert_eq!(status.counts_by_status.get("PENDING"), Some(&1));
}

#[tokio::test]
async fn status_reports_read_cache_activity() {
    let repository = Arc::new(TaskRepository::with_config(
        Arc::new(InMemoryTaskStore::new()),
        &RepositoryConfig::default(),
    ));
    let dispatcher = TaskDispatcher::new(repository, Arc::new(HandlerRegistry::new()));
    dispatcher.initialize(fast_config(1)).await.unwrap();

    let task = dispatcher
        .create_task(NewTask::new("cached", "work"))
        .await
        .unwrap();
    assert!(dispatcher.get_task(&task.id).await.unwrap().is_some());
    assert!(dispatcher.get_task(&task.id).await.unwrap().is_some());

    let status = dispatcher.status().await.unwrap();
    assert!(status.cache_hits >= 1, "hits = {}", status.cache_hits);
}

#[tokio::test]
async fn competing_dispatchers_execute_each_task_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let store = Arc::new(
        SqliteTaskStore::new_embedded(path.to_str().unwrap())
            .await
            .unwrap(),
    );

    let tracker = ExecutionTracker::new();
    let mut dispatchers = Vec::new();
    for _ in 0..2 {
        let dispatcher = dispatcher_over(store.clone());
        dispatcher.initialize(fast_config(4)).await.unwrap();
        register_tracked(&dispatcher, "work", tracker.clone(), Duration::from_millis(5)).await;
        dispatchers.push(dispatcher);
    }

    for i in 0..20 {
        dispatchers[0]
            .create_task(NewTask::new(format!("shared-{i}"), "work"))
            .await
            .unwrap();
    }

    for dispatcher in &dispatchers {
        dispatcher.start_scheduler().await.unwrap();
    }
    let done = TestEnv::wait_for(
        || async {
            dispatchers[0]
                .find_tasks(&TaskFilter::new().with_status(TaskStatus::Completed))
                .await
                .unwrap()
                .len()
                == 20
        },
        Duration::from_secs(10),
    )
    .await;
    for dispatcher in &dispatchers {
        dispatcher.stop_scheduler().await.unwrap();
        assert!(dispatcher.wait_idle(DRAIN_TIMEOUT).await);
    }

    assert!(done);
    let started = tracker.started();
    let unique: HashSet<_> = started.iter().collect();
    assert_eq!(started.len(), 20);
    assert_eq!(unique.len(), 20);
}
