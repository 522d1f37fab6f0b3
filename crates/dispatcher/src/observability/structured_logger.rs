use chrono::{DateTime, Utc};
use taskline_domain::{Task, TaskId};
use taskline_errors::SchedulerError;
use tracing::{debug, error, info, warn};

/// 结构化事件日志
pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_task_claimed(task: &Task) {
        info!(
            event = "task_claimed",
            task.id = %task.id,
            task.name = %task.name,
            task_type = %task.task_type,
            task.priority = task.priority,
            task.retry_attempt = task.retry_attempt,
            "任务已认领，开始执行"
        );
    }

    pub fn log_task_completed(task: &Task, duration_ms: u128) {
        info!(
            event = "task_completed",
            task.id = %task.id,
            task.name = %task.name,
            task_type = %task.task_type,
            task.status = %task.status,
            duration_ms = duration_ms as u64,
            "任务执行成功"
        );
    }

    pub fn log_task_retry_scheduled(task: &Task, next_attempt_at: DateTime<Utc>) {
        warn!(
            event = "task_retry_scheduled",
            task.id = %task.id,
            task.name = %task.name,
            task.retry_attempt = task.retry_attempt,
            task.max_retries = task.max_retries,
            next_attempt_at = %next_attempt_at,
            error = task.last_error.as_deref().unwrap_or_default(),
            "任务执行失败，已安排重试"
        );
    }

    pub fn log_task_failed(task: &Task) {
        error!(
            event = "task_failed",
            task.id = %task.id,
            task.name = %task.name,
            task_type = %task.task_type,
            task.retry_attempt = task.retry_attempt,
            error = task.last_error.as_deref().unwrap_or_default(),
            "任务重试次数耗尽，标记为失败"
        );
    }

    pub fn log_claim_conflict(task_id: &TaskId) {
        debug!(event = "claim_conflict", task.id = %task_id, "任务已被其他执行认领，跳过");
    }

    pub fn log_dispatch_error(task_id: &TaskId, error: &SchedulerError) {
        if error.is_task_scoped() {
            warn!(
                event = "dispatch_error",
                task.id = %task_id,
                error = %error,
                "任务派发失败，不影响其他任务"
            );
        } else {
            error!(
                event = "dispatch_error",
                task.id = %task_id,
                error = %error,
                "任务派发失败"
            );
        }
    }

    pub fn log_tick_error(error: &SchedulerError) {
        if error.is_retryable() {
            warn!(event = "tick_error", error = %error, "调度周期执行失败，将在下一周期重试");
        } else {
            error!(event = "tick_error", error = %error, "调度周期执行失败");
        }
    }
}
