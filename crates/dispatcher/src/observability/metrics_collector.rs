//! 调度引擎指标
//!
//! 通过 `metrics` 门面上报，未安装 recorder 时所有调用都是空操作。

use metrics::{counter, gauge, histogram, Gauge, Histogram};

pub const TASKS_CLAIMED_TOTAL: &str = "taskline_tasks_claimed_total";
pub const TASKS_COMPLETED_TOTAL: &str = "taskline_tasks_completed_total";
pub const TASKS_FAILED_TOTAL: &str = "taskline_tasks_failed_total";
pub const TASKS_RETRIED_TOTAL: &str = "taskline_tasks_retried_total";
pub const CLAIM_CONFLICTS_TOTAL: &str = "taskline_tasks_claim_conflicts_total";
pub const TASKS_IN_FLIGHT: &str = "taskline_tasks_in_flight";
pub const TASK_EXECUTION_DURATION: &str = "taskline_task_execution_duration_seconds";
pub const TICK_DURATION: &str = "taskline_tick_duration_seconds";

pub struct MetricsCollector {
    tasks_in_flight: Gauge,
    tick_duration: Histogram,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_in_flight: gauge!(TASKS_IN_FLIGHT),
            tick_duration: histogram!(TICK_DURATION),
        }
    }

    pub fn record_task_claimed(&self, task_type: &str) {
        counter!(TASKS_CLAIMED_TOTAL, "task_type" => task_type.to_string()).increment(1);
    }

    pub fn record_claim_conflict(&self, task_type: &str) {
        counter!(CLAIM_CONFLICTS_TOTAL, "task_type" => task_type.to_string()).increment(1);
    }

    pub fn record_task_completed(&self, task_type: &str, duration_seconds: f64) {
        counter!(TASKS_COMPLETED_TOTAL, "task_type" => task_type.to_string()).increment(1);
        histogram!(TASK_EXECUTION_DURATION, "task_type" => task_type.to_string(), "outcome" => "success")
            .record(duration_seconds);
    }

    pub fn record_task_execution_failed(&self, task_type: &str, duration_seconds: f64) {
        histogram!(TASK_EXECUTION_DURATION, "task_type" => task_type.to_string(), "outcome" => "error")
            .record(duration_seconds);
    }

    pub fn record_task_retry(&self, task_type: &str) {
        counter!(TASKS_RETRIED_TOTAL, "task_type" => task_type.to_string()).increment(1);
    }

    pub fn record_task_failed(&self, task_type: &str) {
        counter!(TASKS_FAILED_TOTAL, "task_type" => task_type.to_string()).increment(1);
    }

    pub fn update_in_flight(&self, count: usize) {
        self.tasks_in_flight.set(count as f64);
    }

    pub fn record_tick_duration(&self, duration_seconds: f64) {
        self.tick_duration.record(duration_seconds);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
