//! 任务执行协调器
//!
//! 单个任务的完整执行流程：认领（PENDING -> RUNNING 的条件写入）、调用处理器、
//! 写回最终状态。处理器的错误、panic 和超时都在这里被捕获并交给重试服务，
//! 不会传播到调度循环。

use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskline_domain::{
    now_millis, ScheduleType, Task, TaskPatch, TaskStatus, Transition, METADATA_RESULT,
};
use taskline_errors::{SchedulerError, SchedulerResult};
use taskline_infrastructure::TaskRepository;
use tracing::{debug, instrument, warn};

use crate::evaluator::ScheduleEvaluator;
use crate::handler::{HandlerRegistry, TaskContext};
use crate::observability::{MetricsCollector, StructuredLogger};
use crate::retry_service::TaskRetryService;

/// 最终状态写入失败后的重试间隔：按次数线性增长，封顶 `FINAL_PERSIST_MAX_BACKOFF_MS`
const FINAL_PERSIST_BACKOFF_MS: u64 = 50;
const FINAL_PERSIST_MAX_BACKOFF_MS: u64 = 2_000;

/// 单次执行的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    /// INTERVAL 任务执行成功后重新进入 PENDING
    Rearmed,
    RetryScheduled,
    Failed,
    /// 认领失败（被其他执行抢先或任务已不存在）
    Skipped,
}

pub struct ExecutionCoordinator {
    repository: Arc<TaskRepository>,
    registry: Arc<HandlerRegistry>,
    retry: Arc<TaskRetryService>,
    metrics: Arc<MetricsCollector>,
}

impl ExecutionCoordinator {
    pub fn new(
        repository: Arc<TaskRepository>,
        registry: Arc<HandlerRegistry>,
        retry: Arc<TaskRetryService>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            repository,
            registry,
            retry,
            metrics,
        }
    }

    /// 认领并执行任务
    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type))]
    pub async fn run(&self, task: Task) -> SchedulerResult<ExecutionOutcome> {
        match self.claim(&task).await? {
            Some(claimed) => self.execute_claimed(claimed).await,
            None => Ok(ExecutionOutcome::Skipped),
        }
    }

    /// 以 PENDING 为条件把任务写为 RUNNING；竞争失败返回 None
    pub async fn claim(&self, task: &Task) -> SchedulerResult<Option<Task>> {
        let patch = TaskPatch::new().last_executed_at(now_millis());
        match self
            .repository
            .transition(task, Transition::Claim, patch)
            .await
        {
            Ok(claimed) => {
                self.metrics.record_task_claimed(&claimed.task_type);
                StructuredLogger::log_task_claimed(&claimed);
                Ok(Some(claimed))
            }
            Err(SchedulerError::ConcurrencyConflict { .. }) => {
                self.metrics.record_claim_conflict(&task.task_type);
                StructuredLogger::log_claim_conflict(&task.id);
                Ok(None)
            }
            Err(SchedulerError::TaskNotFound { .. }) => {
                debug!("任务在认领前已被删除: {}", task.id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// 执行已认领（RUNNING）的任务并写回最终状态
    pub async fn execute_claimed(&self, task: Task) -> SchedulerResult<ExecutionOutcome> {
        let started = Instant::now();
        let result = self.invoke(&task).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => self
                .metrics
                .record_task_completed(&task.task_type, elapsed.as_secs_f64()),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "任务执行失败");
                self.metrics
                    .record_task_execution_failed(&task.task_type, elapsed.as_secs_f64());
            }
        }

        let updated = self.finalize(&task, &result).await?;
        let outcome = match (updated.status, result.is_ok()) {
            (TaskStatus::Completed, _) => ExecutionOutcome::Completed,
            (TaskStatus::Pending, true) => ExecutionOutcome::Rearmed,
            (TaskStatus::Pending, false) => ExecutionOutcome::RetryScheduled,
            (TaskStatus::Failed, _) => ExecutionOutcome::Failed,
            (status, _) => {
                return Err(SchedulerError::Internal(format!(
                    "任务 {} 执行后处于意外状态 {}",
                    task.id, status
                )))
            }
        };
        if result.is_ok() {
            StructuredLogger::log_task_completed(&updated, elapsed.as_millis());
        }
        Ok(outcome)
    }

    async fn invoke(&self, task: &Task) -> SchedulerResult<Option<Value>> {
        let handler = self.registry.get(&task.task_type).await.ok_or_else(|| {
            SchedulerError::HandlerNotFound {
                task_type: task.task_type.clone(),
            }
        })?;

        let context = TaskContext::from_task(task, task.last_executed_at.unwrap_or_else(now_millis));
        let execution = AssertUnwindSafe(async move { handler.handle(&context).await }).catch_unwind();

        let outcome = match task.timeout_ms {
            Some(timeout_ms) => tokio::time::timeout(Duration::from_millis(timeout_ms), execution)
                .await
                .map_err(|_| SchedulerError::ExecutionTimeout {
                    task_id: task.id.to_string(),
                    timeout_ms,
                })?,
            None => execution.await,
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(SchedulerError::handler_execution(
                task.id.to_string(),
                format!("{e:#}"),
            )),
            Err(panic) => Err(SchedulerError::handler_execution(
                task.id.to_string(),
                format!("处理器 panic: {}", panic_message(panic.as_ref())),
            )),
        }
    }

    /// 写回最终状态
    ///
    /// 存储错误时持续重试直到写入成功，任务不会停留在 RUNNING；其余错误直接返回。
    async fn finalize(
        &self,
        task: &Task,
        result: &SchedulerResult<Option<Value>>,
    ) -> SchedulerResult<Task> {
        let mut failures: u64 = 0;
        loop {
            let persisted = match result {
                Ok(value) => self.persist_success(task, value.as_ref()).await,
                Err(error) => self.retry.on_failure(task, error).await,
            };
            match persisted {
                Err(SchedulerError::Store(message)) => {
                    failures += 1;
                    let delay_ms = FINAL_PERSIST_BACKOFF_MS
                        .saturating_mul(failures)
                        .min(FINAL_PERSIST_MAX_BACKOFF_MS);
                    warn!(
                        task_id = %task.id,
                        attempt = failures,
                        "写回任务最终状态失败，{}ms 后重试: {}",
                        delay_ms,
                        message
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                // 报错的那次写入可能实际已经提交
                Err(conflict @ SchedulerError::ConcurrencyConflict { .. }) if failures > 0 => {
                    return match self.repository.get_fresh(&task.id).await? {
                        Some(current) if current.status != TaskStatus::Running => Ok(current),
                        _ => Err(conflict),
                    };
                }
                other => return other,
            }
        }
    }

    async fn persist_success(&self, task: &Task, value: Option<&Value>) -> SchedulerResult<Task> {
        let mut patch = TaskPatch::new().last_error(None);
        if let (true, Some(value)) = (task.wants_result_stored(), value) {
            let mut metadata = task.metadata.clone();
            metadata.insert(METADATA_RESULT.to_string(), value.clone());
            patch = patch.metadata(metadata);
        }

        match task.schedule_type {
            ScheduleType::Interval => {
                let next_run = match (task.last_executed_at, task.interval_ms) {
                    (Some(last), Some(interval)) => {
                        Some(ScheduleEvaluator::add_interval(last, interval))
                    }
                    _ => None,
                };
                let patch = patch.retry_attempt(0).scheduled_time(next_run);
                self.repository
                    .transition(task, Transition::Rearm, patch)
                    .await
            }
            ScheduleType::Priority | ScheduleType::ExactTime => {
                self.repository
                    .transition(task, Transition::Complete, patch)
                    .await
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知 panic".to_string()
    }
}
