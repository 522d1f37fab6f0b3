//! 领域实体与存储记录之间的转换

use serde_json::{Map, Value};
use taskline_domain::{
    from_millis, to_millis, RecordPatch, ScheduleType, Task, TaskPatch, TaskRecord, TaskStatus,
};
use taskline_errors::{SchedulerError, SchedulerResult};

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn task_to_record(task: &Task) -> TaskRecord {
        TaskRecord {
            id: task.id.to_string(),
            name: task.name.clone(),
            description: task.description.clone(),
            task_type: task.task_type.clone(),
            parameters: task.parameters.clone(),
            schedule_type: task.schedule_type.as_str().to_string(),
            priority: i64::from(task.priority),
            status: task.status.as_str().to_string(),
            scheduled_time: task.scheduled_time.map(to_millis),
            interval_ms: task.interval_ms.map(Self::u64_to_i64),
            timeout_ms: task.timeout_ms.map(Self::u64_to_i64),
            created_at: to_millis(task.created_at),
            updated_at: to_millis(task.updated_at),
            last_executed_at: task.last_executed_at.map(to_millis),
            retry_attempt: i64::from(task.retry_attempt),
            max_retries: i64::from(task.max_retries),
            last_error: task.last_error.clone(),
            metadata: Value::Object(task.metadata.clone()),
            version: task.version,
        }
    }

    pub fn record_to_task(record: TaskRecord) -> SchedulerResult<Task> {
        let metadata = match record.metadata {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(SchedulerError::Serialization(format!(
                    "任务 {} 的 metadata 不是对象: {other}",
                    record.id
                )))
            }
        };

        Ok(Task {
            id: record.id.parse()?,
            name: record.name,
            description: record.description,
            task_type: record.task_type,
            parameters: record.parameters,
            schedule_type: record.schedule_type.parse::<ScheduleType>()?,
            priority: Self::narrow(record.priority, "priority")?,
            status: record.status.parse::<TaskStatus>()?,
            scheduled_time: record.scheduled_time.map(from_millis).transpose()?,
            interval_ms: record
                .interval_ms
                .map(|v| Self::narrow(v, "interval_ms"))
                .transpose()?,
            timeout_ms: record
                .timeout_ms
                .map(|v| Self::narrow(v, "timeout_ms"))
                .transpose()?,
            created_at: from_millis(record.created_at)?,
            updated_at: from_millis(record.updated_at)?,
            last_executed_at: record.last_executed_at.map(from_millis).transpose()?,
            retry_attempt: Self::narrow(record.retry_attempt, "retry_attempt")?,
            max_retries: Self::narrow(record.max_retries, "max_retries")?,
            last_error: record.last_error,
            metadata,
            version: record.version,
        })
    }

    pub fn patch_to_record_patch(patch: &TaskPatch) -> RecordPatch {
        RecordPatch {
            name: patch.name.clone(),
            description: patch.description.clone(),
            parameters: patch.parameters.clone(),
            priority: patch.priority.map(i64::from),
            status: patch.status.map(|s| s.as_str().to_string()),
            scheduled_time: patch.scheduled_time.map(|t| t.map(to_millis)),
            last_executed_at: patch.last_executed_at.map(to_millis),
            retry_attempt: patch.retry_attempt.map(i64::from),
            max_retries: patch.max_retries.map(i64::from),
            last_error: patch.last_error.clone(),
            metadata: patch.metadata.clone().map(Value::Object),
        }
    }

    fn u64_to_i64(value: u64) -> i64 {
        i64::try_from(value).unwrap_or(i64::MAX)
    }

    fn narrow<T: TryFrom<i64>>(value: i64, field: &str) -> SchedulerResult<T> {
        T::try_from(value)
            .map_err(|_| SchedulerError::Serialization(format!("字段 {field} 超出范围: {value}")))
    }
}
