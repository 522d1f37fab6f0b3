use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use taskline_config::RetryConfig;
use taskline_domain::{now_millis, Task, TaskPatch, Transition};
use taskline_errors::{SchedulerError, SchedulerResult};
use taskline_infrastructure::TaskRepository;
use tracing::{debug, instrument};

use crate::observability::{MetricsCollector, StructuredLogger};
use crate::observer::FailureObservers;

/// 任务重试服务
///
/// 处理器失败后决定任务是以退避时间重新进入 PENDING，还是进入 FAILED 终态。
pub struct TaskRetryService {
    repository: Arc<TaskRepository>,
    config: RetryConfig,
    observers: Arc<FailureObservers>,
    metrics: Arc<MetricsCollector>,
}

impl TaskRetryService {
    pub fn new(
        repository: Arc<TaskRepository>,
        config: RetryConfig,
        observers: Arc<FailureObservers>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            repository,
            config,
            observers,
            metrics,
        }
    }

    /// 计算第 `attempt` 次失败后的退避时长（指数退避 + 抖动）
    ///
    /// `attempt` 为递增前的重试计数，第一次重试等待 `base_delay_ms`。
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_ms;
        let max = self.config.max_delay_ms.max(base);

        let exponential = base.saturating_mul(1u64 << attempt.min(32)).min(max);

        let jitter_range = exponential as f64 * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let delay_ms = (exponential as f64 + jitter).clamp(base as f64, max as f64) as u64;

        Duration::milliseconds(i64::try_from(delay_ms).unwrap_or(i64::MAX / 1_000))
    }

    /// 计算下次重试时间
    pub fn calculate_next_retry_time(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.calculate_backoff(attempt))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// 处理一次执行失败，`task` 为 RUNNING 状态的最新快照
    #[instrument(skip(self, task, error), fields(task_id = %task.id, retry_attempt = task.retry_attempt))]
    pub async fn on_failure(&self, task: &Task, error: &SchedulerError) -> SchedulerResult<Task> {
        let message = failure_message(error);

        if task.can_retry() {
            let next_retry_at = self.calculate_next_retry_time(task.retry_attempt, now_millis());
            let patch = TaskPatch::new()
                .retry_attempt(task.retry_attempt + 1)
                .scheduled_time(Some(next_retry_at))
                .last_error(Some(message));
            let updated = self
                .repository
                .transition(task, Transition::Retry, patch)
                .await?;

            self.metrics.record_task_retry(&updated.task_type);
            StructuredLogger::log_task_retry_scheduled(&updated, next_retry_at);
            return Ok(updated);
        }

        let patch = TaskPatch::new().last_error(Some(message.clone()));
        let updated = self
            .repository
            .transition(task, Transition::Fail, patch)
            .await?;

        self.metrics.record_task_failed(&updated.task_type);
        StructuredLogger::log_task_failed(&updated);
        self.observers.notify(&updated, &message);
        debug!("失败任务已通知观察者");
        Ok(updated)
    }
}

/// 持久化到 last_error 的错误描述
fn failure_message(error: &SchedulerError) -> String {
    match error {
        SchedulerError::HandlerExecution { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskline_domain::{NewTask, TaskStatus};
    use taskline_infrastructure::InMemoryTaskStore;

    fn service(config: RetryConfig) -> (TaskRetryService, Arc<TaskRepository>) {
        let repository = Arc::new(TaskRepository::new(Arc::new(InMemoryTaskStore::new())));
        let service = TaskRetryService::new(
            repository.clone(),
            config,
            Arc::new(FailureObservers::new()),
            Arc::new(MetricsCollector::new()),
        );
        (service, repository)
    }

    fn no_jitter(base: u64, max: u64) -> RetryConfig {
        RetryConfig {
            base_delay_ms: base,
            max_delay_ms: max,
            jitter_factor: 0.0,
        }
    }

    async fn running_task(repository: &TaskRepository, max_retries: u32) -> Task {
        let task = repository
            .create(NewTask::new("flaky", "flaky").with_max_retries(max_retries))
            .await
            .unwrap();
        repository
            .transition(
                &task,
                Transition::Claim,
                TaskPatch::new().last_executed_at(now_millis()),
            )
            .await
            .unwrap()
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let (service, _) = service(no_jitter(1_000, 10_000));
        assert_eq!(service.calculate_backoff(0).num_milliseconds(), 1_000);
        assert_eq!(service.calculate_backoff(1).num_milliseconds(), 2_000);
        assert_eq!(service.calculate_backoff(2).num_milliseconds(), 4_000);
        assert_eq!(service.calculate_backoff(3).num_milliseconds(), 8_000);
        assert_eq!(service.calculate_backoff(4).num_milliseconds(), 10_000);
        assert_eq!(service.calculate_backoff(500).num_milliseconds(), 10_000);
    }

    #[test]
    fn test_backoff_jitter_stays_within_bounds() {
        let (service, _) = service(RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_factor: 0.5,
        });
        for attempt in 0..10 {
            let delay = service.calculate_backoff(attempt).num_milliseconds();
            assert!((100..=1_000).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_next_retry_time_is_after_now() {
        let (service, _) = service(no_jitter(500, 5_000));
        let now = now_millis();
        let next = service.calculate_next_retry_time(1, now);
        assert_eq!((next - now).num_milliseconds(), 1_000);
    }

    #[tokio::test]
    async fn test_on_failure_schedules_retry() {
        let (service, repository) = service(no_jitter(1_000, 10_000));
        let task = running_task(&repository, 2).await;

        let error = SchedulerError::handler_execution(task.id.to_string(), "boom");
        let updated = service.on_failure(&task, &error).await.unwrap();

        assert_eq!(updated.status, TaskStatus::Pending);
        assert_eq!(updated.retry_attempt, 1);
        assert_eq!(updated.last_error.as_deref(), Some("boom"));
        let scheduled = updated.scheduled_time.unwrap();
        assert!(scheduled >= task.last_executed_at.unwrap() + Duration::milliseconds(1_000));
    }

    #[tokio::test]
    async fn test_on_failure_marks_failed_when_exhausted() {
        let (service, repository) = service(no_jitter(1, 10));
        let task = running_task(&repository, 0).await;

        let error = SchedulerError::HandlerNotFound {
            task_type: "flaky".to_string(),
        };
        let updated = service.on_failure(&task, &error).await.unwrap();

        assert_eq!(updated.status, TaskStatus::Failed);
        assert_eq!(updated.retry_attempt, 0);
        assert_eq!(updated.last_error, Some(error.to_string()));
    }
}
