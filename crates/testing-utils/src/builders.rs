//! Test data builders for creating test entities

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Map, Value};
use taskline_domain::{ScheduleType, Task, TaskId, TaskStatus, METADATA_TAGS};

/// Fixed reference instant for synthetic clocks
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// `epoch() + seconds`
pub fn at_secs(seconds: i64) -> DateTime<Utc> {
    epoch() + Duration::seconds(seconds)
}

/// Builder for creating test Task entities
///
/// Produces in-memory snapshots only; nothing is persisted.
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        let now = epoch();
        Self {
            task: Task {
                id: TaskId::new(),
                name: "test_task".to_string(),
                description: None,
                task_type: "noop".to_string(),
                parameters: Value::Null,
                schedule_type: ScheduleType::Priority,
                priority: 0,
                status: TaskStatus::Pending,
                scheduled_time: None,
                interval_ms: None,
                timeout_ms: None,
                created_at: now,
                updated_at: now,
                last_executed_at: None,
                retry_attempt: 0,
                max_retries: 0,
                last_error: None,
                metadata: Map::new(),
                version: 1,
            },
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.task.name = name.to_string();
        self
    }

    pub fn with_task_type(mut self, task_type: &str) -> Self {
        self.task.task_type = task_type.to_string();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn exact_time(mut self, scheduled_time: DateTime<Utc>) -> Self {
        self.task.schedule_type = ScheduleType::ExactTime;
        self.task.scheduled_time = Some(scheduled_time);
        self
    }

    pub fn interval(mut self, interval_ms: u64) -> Self {
        self.task.schedule_type = ScheduleType::Interval;
        self.task.interval_ms = Some(interval_ms);
        self
    }

    pub fn with_scheduled_time(mut self, scheduled_time: DateTime<Utc>) -> Self {
        self.task.scheduled_time = Some(scheduled_time);
        self
    }

    pub fn last_executed_at(mut self, at: DateTime<Utc>) -> Self {
        self.task.last_executed_at = Some(at);
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.task.created_at = at;
        self.task.updated_at = self.task.updated_at.max(at);
        self
    }

    pub fn with_retries(mut self, retry_attempt: u32, max_retries: u32) -> Self {
        self.task.retry_attempt = retry_attempt;
        self.task.max_retries = max_retries;
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        let tags = tags.iter().map(|t| Value::String(t.to_string())).collect();
        self.task
            .metadata
            .insert(METADATA_TAGS.to_string(), Value::Array(tags));
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}
