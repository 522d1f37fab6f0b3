//! 调度器
//!
//! `TaskDispatcher` 是调度引擎的对外入口：生命周期控制（initialize/start/stop/reset）、
//! 生产者接口（创建、查询、取消、删除任务）以及周期性的调度循环。
//!
//! 每个调度周期：
//! 1. 从存储读取已到期的 PENDING 候选任务（按优先级排序，数量受 page_size 限制）
//! 2. 用 `ScheduleEvaluator` 再次判定到期并排序
//! 3. 按剩余执行名额派发给执行协调器，派发不阻塞调度循环
//!
//! 执行名额归 `TaskDispatcher` 所有，跨 initialize/reset 保留：
//! 重置前派发的执行在结束前一直占用名额。

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskline_config::{ConfigValidator, DispatcherConfig};
use taskline_domain::{
    now_millis, NewTask, Task, TaskFilter, TaskId, TaskOrder, TaskPatch, TaskStatus, Transition,
};
use taskline_errors::{SchedulerError, SchedulerResult};
use taskline_infrastructure::TaskRepository;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::coordinator::{ExecutionCoordinator, ExecutionOutcome};
use crate::evaluator::ScheduleEvaluator;
use crate::handler::HandlerRegistry;
use crate::observability::{MetricsCollector, StructuredLogger};
use crate::observer::{FailureObserver, FailureObservers};
use crate::retry_service::TaskRetryService;

/// 删除任务时状态竞争的最大重读次数
const DELETE_ATTEMPTS: usize = 3;

/// 单个调度周期的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// 存储返回的候选任务数
    pub candidates: usize,
    /// 判定为到期的任务数
    pub due: usize,
    pub dispatched: usize,
    /// 因并发上限本周期未派发的任务数
    pub skipped_for_capacity: usize,
}

/// 调度器运行状态
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub initialized: bool,
    pub running: bool,
    pub in_flight: usize,
    pub max_concurrent_tasks: Option<usize>,
    pub counts_by_status: BTreeMap<String, u64>,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// 一次 initialize 之后的调度运行时
struct DispatchRuntime {
    config: DispatcherConfig,
    slots: Arc<ExecutionSlots>,
    coordinator: Arc<ExecutionCoordinator>,
    retry: Arc<TaskRetryService>,
    repository: Arc<TaskRepository>,
    metrics: Arc<MetricsCollector>,
}

struct SchedulerLoop {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct DispatcherState {
    runtime: Option<Arc<DispatchRuntime>>,
    scheduler_loop: Option<SchedulerLoop>,
}

impl DispatcherState {
    /// 调度循环遇到致命错误会自行退出，此时视为未运行
    fn loop_active(&self) -> bool {
        self.scheduler_loop
            .as_ref()
            .is_some_and(|scheduler_loop| !scheduler_loop.handle.is_finished())
    }
}

pub struct TaskDispatcher {
    repository: Arc<TaskRepository>,
    registry: Arc<HandlerRegistry>,
    observers: Arc<FailureObservers>,
    metrics: Arc<MetricsCollector>,
    state: Mutex<DispatcherState>,
    running: Arc<AtomicBool>,
    slots: Arc<ExecutionSlots>,
}

impl TaskDispatcher {
    pub fn new(repository: Arc<TaskRepository>, registry: Arc<HandlerRegistry>) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        Self {
            repository,
            registry,
            observers: Arc::new(FailureObservers::new()),
            slots: Arc::new(ExecutionSlots::new(metrics.clone())),
            metrics,
            state: Mutex::new(DispatcherState::default()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn repository(&self) -> &Arc<TaskRepository> {
        &self.repository
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn register_failure_observer(&self, observer: Arc<dyn FailureObserver>) {
        self.observers.register(observer);
    }

    /// 初始化调度器：校验配置、探测存储、重建执行协调器，可选回收遗留的 RUNNING 任务
    ///
    /// 调度循环运行期间不能重新初始化。执行名额沿用已有计数，未结束的执行仍然占用名额。
    #[instrument(skip(self, config))]
    pub async fn initialize(&self, config: DispatcherConfig) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        if state.loop_active() {
            return Err(SchedulerError::invalid_state(
                "调度器运行中，请先停止再重新初始化",
            ));
        }

        config
            .validate()
            .map_err(|e| SchedulerError::config_error(e.to_string()))?;
        self.repository.health_check().await?;

        let retry = Arc::new(TaskRetryService::new(
            self.repository.clone(),
            config.retry.clone(),
            self.observers.clone(),
            self.metrics.clone(),
        ));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            self.repository.clone(),
            self.registry.clone(),
            retry.clone(),
            self.metrics.clone(),
        ));
        let runtime = Arc::new(DispatchRuntime {
            config,
            slots: self.slots.clone(),
            coordinator,
            retry,
            repository: self.repository.clone(),
            metrics: self.metrics.clone(),
        });

        if let Some(stale_after_ms) = runtime.config.recover_stale_after_ms {
            let recovered = runtime.recover_stale(stale_after_ms).await?;
            if recovered > 0 {
                warn!("回收 {} 个超时未完成的 RUNNING 任务", recovered);
            }
        }

        info!(
            scheduling_interval_ms = runtime.config.scheduling_interval_ms,
            max_concurrent_tasks = runtime.config.max_concurrent_tasks,
            store = self.repository.store().backend_name(),
            "调度器初始化完成"
        );
        state.runtime = Some(runtime);
        Ok(())
    }

    pub async fn start_scheduler(&self) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        let runtime = state
            .runtime
            .clone()
            .ok_or_else(|| SchedulerError::invalid_state("调度器尚未初始化"))?;
        if state.loop_active() {
            return Err(SchedulerError::invalid_state("调度器已在运行"));
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        self.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(scheduler_loop(
            runtime.clone(),
            self.running.clone(),
            shutdown_rx,
        ));
        state.scheduler_loop = Some(SchedulerLoop {
            shutdown_tx,
            handle,
        });

        info!(
            "调度器已启动，调度间隔 {}ms",
            runtime.config.scheduling_interval_ms
        );
        Ok(())
    }

    /// 停止调度循环并等待当前周期结束；已派发的任务继续执行至完成
    pub async fn stop_scheduler(&self) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        self.stop_loop(&mut state).await;
        Ok(())
    }

    /// 停止调度并回到未初始化状态，已持久化的任务不受影响
    pub async fn reset(&self) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        self.stop_loop(&mut state).await;
        state.runtime = None;
        info!("调度器已重置");
        Ok(())
    }

    pub fn is_scheduler_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.runtime.is_some()
    }

    /// 立即执行一个调度周期
    pub async fn run_tick(&self) -> SchedulerResult<TickReport> {
        let runtime = self
            .state
            .lock()
            .await
            .runtime
            .clone()
            .ok_or_else(|| SchedulerError::invalid_state("调度器尚未初始化"))?;
        runtime.run_tick().await
    }

    pub async fn create_task(&self, new_task: NewTask) -> SchedulerResult<Task> {
        self.repository.create(new_task).await
    }

    pub async fn find_tasks(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        self.repository.find(filter).await
    }

    pub async fn get_task(&self, id: &TaskId) -> SchedulerResult<Option<Task>> {
        self.repository.get_by_id(id).await
    }

    /// 取消 PENDING 任务
    pub async fn cancel_task(&self, id: &TaskId) -> SchedulerResult<Task> {
        let task = self
            .repository
            .get_fresh(id)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(id.to_string()))?;
        let cancelled = self
            .repository
            .transition(&task, Transition::Cancel, TaskPatch::new())
            .await?;
        info!(task_id = %id, "任务已取消");
        Ok(cancelled)
    }

    /// 删除任务；RUNNING 任务不能删除
    ///
    /// 以读到的状态为条件删除，删除与认领竞争时重新读取状态。
    pub async fn delete_task(&self, id: &TaskId) -> SchedulerResult<bool> {
        let mut attempt = 1;
        loop {
            let Some(task) = self.repository.get_fresh(id).await? else {
                return Ok(false);
            };
            if task.status == TaskStatus::Running {
                return Err(SchedulerError::invalid_state(format!(
                    "任务 {id} 正在执行，不能删除"
                )));
            }
            match self.repository.delete_if_status(id, task.status).await {
                Err(SchedulerError::ConcurrencyConflict { .. }) if attempt < DELETE_ATTEMPTS => {
                    debug!(task_id = %id, attempt, "删除时任务状态已变化，重新读取");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.slots.in_flight()
    }

    /// 等待所有已派发的执行结束，超时返回 false
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.slots.wait_idle(timeout).await
    }

    pub async fn status(&self) -> SchedulerResult<SchedulerStatus> {
        let (initialized, max_concurrent_tasks) = {
            let state = self.state.lock().await;
            (
                state.runtime.is_some(),
                state
                    .runtime
                    .as_ref()
                    .map(|runtime| runtime.config.max_concurrent_tasks),
            )
        };
        let counts_by_status = self
            .repository
            .count_by_status()
            .await?
            .into_iter()
            .map(|(status, count)| (status.to_string(), count))
            .collect();
        let cache = self.repository.cache_stats().await;

        Ok(SchedulerStatus {
            initialized,
            running: self.is_scheduler_running(),
            in_flight: self.in_flight(),
            max_concurrent_tasks,
            counts_by_status,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
        })
    }

    async fn stop_loop(&self, state: &mut DispatcherState) {
        let Some(scheduler_loop) = state.scheduler_loop.take() else {
            debug!("调度器未在运行");
            return;
        };
        let _ = scheduler_loop.shutdown_tx.send(());
        if let Err(e) = scheduler_loop.handle.await {
            error!("调度循环异常退出: {}", e);
        }
        self.running.store(false, Ordering::SeqCst);
        info!("调度器已停止，进行中的任务数: {}", self.in_flight());
    }
}

async fn scheduler_loop(
    runtime: Arc<DispatchRuntime>,
    running: Arc<AtomicBool>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker =
        tokio::time::interval(Duration::from_millis(runtime.config.scheduling_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!("调度循环收到停止信号");
                break;
            }
            _ = ticker.tick() => {
                match runtime.run_tick().await {
                    Ok(report) if report.dispatched > 0 => debug!(?report, "调度周期完成"),
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "调度周期遇到致命错误，调度循环退出");
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => StructuredLogger::log_tick_error(&e),
                }
            }
        }
    }
}

impl DispatchRuntime {
    async fn run_tick(&self) -> SchedulerResult<TickReport> {
        let started = Instant::now();
        let mut report = TickReport::default();

        let limit = self.config.max_concurrent_tasks;
        if self.slots.available(limit) == 0 {
            debug!("并发已满，跳过本周期");
            return Ok(report);
        }

        let now = now_millis();
        let filter = TaskFilter::new()
            .with_status(TaskStatus::Pending)
            .due_before(now)
            .ordered_by(TaskOrder::PriorityDesc)
            .with_limit(self.config.page_size);
        let candidates = self.repository.find(&filter).await?;
        report.candidates = candidates.len();

        let mut due: Vec<Task> = candidates
            .into_iter()
            .filter(|task| ScheduleEvaluator::is_due(task, now))
            .collect();
        due.sort_by(ScheduleEvaluator::compare_priority);
        report.due = due.len();

        for task in due {
            let Some(slot) = self.slots.try_acquire(limit) else {
                report.skipped_for_capacity += 1;
                continue;
            };
            let coordinator = self.coordinator.clone();

            tokio::spawn(async move {
                let _slot = slot;
                let task_id = task.id;
                match coordinator.run(task).await {
                    Ok(ExecutionOutcome::Skipped) => {}
                    Ok(outcome) => debug!(task_id = %task_id, ?outcome, "任务执行结束"),
                    Err(e) => StructuredLogger::log_dispatch_error(&task_id, &e),
                }
            });
            report.dispatched += 1;
        }

        self.metrics
            .record_tick_duration(started.elapsed().as_secs_f64());
        Ok(report)
    }

    /// 把 last_executed_at 早于阈值的 RUNNING 任务交给重试服务
    async fn recover_stale(&self, stale_after_ms: u64) -> SchedulerResult<usize> {
        let threshold = i64::try_from(stale_after_ms)
            .ok()
            .and_then(ChronoDuration::try_milliseconds)
            .and_then(|stale_after| now_millis().checked_sub_signed(stale_after))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let running = self
            .repository
            .find(&TaskFilter::new().with_status(TaskStatus::Running))
            .await?;

        let mut recovered = 0;
        for task in running {
            let stale = task
                .last_executed_at
                .map_or(true, |executed_at| executed_at < threshold);
            if !stale {
                continue;
            }
            let error = SchedulerError::handler_execution(
                task.id.to_string(),
                "运行中任务超时未完成，已回收",
            );
            match self.retry.on_failure(&task, &error).await {
                Ok(_) => recovered += 1,
                Err(SchedulerError::ConcurrencyConflict { .. }) => {
                    debug!(task_id = %task.id, "任务状态已变化，跳过回收");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }
}

/// 执行名额计数，`available = max_concurrent_tasks - in_flight`
struct ExecutionSlots {
    in_flight: AtomicUsize,
    idle: Notify,
    metrics: Arc<MetricsCollector>,
}

impl ExecutionSlots {
    fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            metrics,
        }
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn available(&self, limit: usize) -> usize {
        limit.saturating_sub(self.in_flight())
    }

    /// 计数未达到 `limit` 时占用一个名额
    fn try_acquire(self: &Arc<Self>, limit: usize) -> Option<SlotGuard> {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < limit).then_some(count + 1)
            })
            .ok()?;
        self.metrics.update_in_flight(previous + 1);
        Some(SlotGuard {
            slots: Arc::clone(self),
        })
    }

    async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // 先登记再检查计数，避免错过最后一个执行结束的通知
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }
}

/// 执行结束（drop）时归还名额
struct SlotGuard {
    slots: Arc<ExecutionSlots>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let remaining = self.slots.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        self.slots.metrics.update_in_flight(remaining);
        if remaining == 0 {
            self.slots.idle.notify_waiters();
        }
    }
}
