//! 存储边界
//!
//! 存储层只认识 `TaskRecord` 这一扁平结构：时间为毫秒整数，枚举为字符串。
//! 领域实体与记录之间的转换由仓储层负责。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use taskline_errors::{SchedulerError, SchedulerResult};

use crate::query::{TaskFilter, TaskOrder};
use crate::value_objects::TaskStatus;

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> SchedulerResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| SchedulerError::Serialization(format!("无效的时间戳: {ms}")))
}

/// 截断到毫秒精度，保证写入前后的时间比较一致
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub task_type: String,
    pub parameters: Value,
    pub schedule_type: String,
    pub priority: i64,
    pub status: String,
    pub scheduled_time: Option<i64>,
    pub interval_ms: Option<i64>,
    pub timeout_ms: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_executed_at: Option<i64>,
    pub retry_attempt: i64,
    pub max_retries: i64,
    pub last_error: Option<String>,
    pub metadata: Value,
    pub version: i64,
}

impl TaskRecord {
    pub fn tags(&self) -> Vec<&str> {
        self.metadata
            .get(crate::entities::METADATA_TAGS)
            .and_then(Value::as_array)
            .map(|tags| tags.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// 内存过滤，语义与 `TaskQueryBuilder` 生成的 SQL 一致
    pub fn matches(&self, filter: &TaskFilter) -> bool {
        if let Some(ids) = &filter.ids {
            if !ids.iter().any(|id| id.to_string() == self.id) {
                return false;
            }
        }
        if let Some(status) = filter.status {
            if self.status != status.as_str() {
                return false;
            }
        }
        if let Some(pattern) = &filter.name_contains {
            if !self.name.contains(pattern.as_str()) {
                return false;
            }
        }
        if !filter.tags.is_empty() {
            let tags = self.tags();
            if !filter.tags.iter().all(|tag| tags.contains(&tag.as_str())) {
                return false;
            }
        }
        if let Some(due_before) = filter.due_before {
            if let Some(scheduled) = self.scheduled_time {
                if scheduled > to_millis(due_before) {
                    return false;
                }
            }
        }
        true
    }

    /// 应用补丁：递增版本号，updated_at 单调不减
    pub fn apply(&mut self, patch: &RecordPatch, now_ms: i64) -> SchedulerResult<()> {
        let mut next = self.clone();
        if let Some(name) = &patch.name {
            next.name = name.clone();
        }
        if let Some(description) = &patch.description {
            next.description = description.clone();
        }
        if let Some(parameters) = &patch.parameters {
            next.parameters = parameters.clone();
        }
        if let Some(priority) = patch.priority {
            next.priority = priority;
        }
        if let Some(status) = &patch.status {
            next.status = status.clone();
        }
        if let Some(scheduled_time) = patch.scheduled_time {
            next.scheduled_time = scheduled_time;
        }
        if let Some(last_executed_at) = patch.last_executed_at {
            next.last_executed_at = Some(last_executed_at);
        }
        if let Some(retry_attempt) = patch.retry_attempt {
            next.retry_attempt = retry_attempt;
        }
        if let Some(max_retries) = patch.max_retries {
            next.max_retries = max_retries;
        }
        if let Some(last_error) = &patch.last_error {
            next.last_error = last_error.clone();
        }
        if let Some(metadata) = &patch.metadata {
            next.metadata = metadata.clone();
        }

        if next.retry_attempt > next.max_retries {
            return Err(SchedulerError::validation(format!(
                "任务 {} 重试次数 {} 超过最大重试次数 {}",
                self.id, next.retry_attempt, next.max_retries
            )));
        }

        next.updated_at = self.updated_at.max(now_ms);
        next.version = self.version + 1;
        *self = next;
        Ok(())
    }
}

/// 排序比较，与 SQL 的 ORDER BY 子句一致；`seq` 为插入顺序
pub fn compare_records(order: TaskOrder, a: (&TaskRecord, u64), b: (&TaskRecord, u64)) -> Ordering {
    let by_created = a.0.created_at.cmp(&b.0.created_at).then(a.1.cmp(&b.1));
    match order {
        TaskOrder::CreatedAsc => by_created,
        TaskOrder::PriorityDesc => b.0.priority.cmp(&a.0.priority).then(by_created),
    }
}

/// 记录级补丁，字段语义同 `TaskPatch`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub parameters: Option<Value>,
    pub priority: Option<i64>,
    pub status: Option<String>,
    pub scheduled_time: Option<Option<i64>>,
    pub last_executed_at: Option<i64>,
    pub retry_attempt: Option<i64>,
    pub max_retries: Option<i64>,
    pub last_error: Option<Option<String>>,
    pub metadata: Option<Value>,
}

/// 任务存储抽象
///
/// 读操作在记录不存在时返回空结果而不是错误；写操作失败统一映射为 `SchedulerError::Store`。
/// `update_if_status` 是认领等状态流转唯一允许使用的写入方式。
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 插入新记录，ID重复时返回存储错误
    async fn insert(&self, record: TaskRecord) -> SchedulerResult<TaskRecord>;

    async fn get(&self, id: &str) -> SchedulerResult<Option<TaskRecord>>;

    async fn find(&self, filter: &TaskFilter) -> SchedulerResult<Vec<TaskRecord>>;

    /// 无条件更新，记录不存在时返回 `TaskNotFound`
    async fn update(&self, id: &str, patch: &RecordPatch) -> SchedulerResult<TaskRecord>;

    /// 比较并设置：仅当当前状态等于 `expected` 时写入，否则返回 `ConcurrencyConflict`
    async fn update_if_status(
        &self,
        id: &str,
        expected: TaskStatus,
        patch: &RecordPatch,
    ) -> SchedulerResult<TaskRecord>;

    async fn delete(&self, id: &str) -> SchedulerResult<bool>;

    /// 条件删除：仅当当前状态等于 `expected` 时删除
    ///
    /// 记录不存在返回 `false`，状态不符返回 `ConcurrencyConflict`。
    async fn delete_if_status(&self, id: &str, expected: TaskStatus) -> SchedulerResult<bool>;

    async fn count_by_status(&self) -> SchedulerResult<HashMap<TaskStatus, u64>>;

    async fn health_check(&self) -> SchedulerResult<()>;

    fn backend_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_objects::TaskId;
    use serde_json::json;

    fn record(id: &str, priority: i64, created_at: i64) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            name: format!("task-{id}"),
            description: None,
            task_type: "noop".to_string(),
            parameters: Value::Null,
            schedule_type: "PRIORITY".to_string(),
            priority,
            status: "PENDING".to_string(),
            scheduled_time: None,
            interval_ms: None,
            timeout_ms: None,
            created_at,
            updated_at: created_at,
            last_executed_at: None,
            retry_attempt: 0,
            max_retries: 1,
            last_error: None,
            metadata: json!({"tags": ["daily", "ops"]}),
            version: 1,
        }
    }

    #[test]
    fn test_apply_keeps_updated_at_monotonic() {
        let mut r = record("a", 0, 1_000);
        let patch = RecordPatch {
            status: Some("RUNNING".to_string()),
            last_executed_at: Some(900),
            ..Default::default()
        };
        r.apply(&patch, 900).unwrap();
        assert_eq!(r.updated_at, 1_000);
        assert_eq!(r.status, "RUNNING");
        assert_eq!(r.version, 2);

        r.apply(&RecordPatch::default(), 2_000).unwrap();
        assert_eq!(r.updated_at, 2_000);
    }

    #[test]
    fn test_apply_rejects_retry_overflow() {
        let mut r = record("a", 0, 1_000);
        let patch = RecordPatch {
            retry_attempt: Some(2),
            ..Default::default()
        };
        assert!(r.apply(&patch, 1_000).is_err());
        assert_eq!(r.retry_attempt, 0);
        assert_eq!(r.version, 1);
    }

    #[test]
    fn test_matches_filter() {
        let id = TaskId::new();
        let mut r = record(&id.to_string(), 0, 1_000);
        r.scheduled_time = Some(5_000);

        assert!(r.matches(&TaskFilter::new()));
        assert!(r.matches(&TaskFilter::by_ids([id])));
        assert!(!r.matches(&TaskFilter::by_ids([TaskId::new()])));
        assert!(!r.matches(&TaskFilter::by_ids(Vec::new())));
        assert!(r.matches(&TaskFilter::new().with_name_contains("task-")));
        assert!(!r.matches(&TaskFilter::new().with_name_contains("TASK-")));
        assert!(r.matches(&TaskFilter::new().with_tag("daily").with_tag("ops")));
        assert!(!r.matches(&TaskFilter::new().with_tag("daily").with_tag("weekly")));
        assert!(!r.matches(&TaskFilter::new().with_status(TaskStatus::Running)));

        let early = from_millis(4_000).unwrap();
        let late = from_millis(5_000).unwrap();
        assert!(!r.matches(&TaskFilter::new().due_before(early)));
        assert!(r.matches(&TaskFilter::new().due_before(late)));
    }

    #[test]
    fn test_compare_records() {
        let a = record("a", 5, 1_000);
        let b = record("b", 8, 2_000);
        assert_eq!(
            compare_records(TaskOrder::PriorityDesc, (&a, 0), (&b, 1)),
            Ordering::Greater
        );
        assert_eq!(
            compare_records(TaskOrder::CreatedAsc, (&a, 0), (&b, 1)),
            Ordering::Less
        );
        let c = record("c", 5, 1_000);
        assert_eq!(
            compare_records(TaskOrder::PriorityDesc, (&a, 0), (&c, 1)),
            Ordering::Less
        );
    }
}
