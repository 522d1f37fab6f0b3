use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use taskline_errors::{SchedulerError, SchedulerResult};

use crate::value_objects::{ScheduleType, TaskId, TaskStatus, Transition};

/// metadata 中用于标签过滤的键
pub const METADATA_TAGS: &str = "tags";
/// metadata 中声明需要保存处理结果的键
pub const METADATA_STORE_RESULT: &str = "store_result";
/// 处理结果写入 metadata 的键
pub const METADATA_RESULT: &str = "result";

const MAX_NAME_LEN: usize = 255;
const MAX_RETRIES_LIMIT: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: Option<String>,
    /// 处理器注册表的键
    pub task_type: String,
    pub parameters: Value,
    pub schedule_type: ScheduleType,
    pub priority: i32,
    pub status: TaskStatus,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 仅在进入 RUNNING 时设置
    pub last_executed_at: Option<DateTime<Utc>>,
    pub retry_attempt: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub metadata: Map<String, Value>,
    /// 存储层维护的写入计数
    pub version: i64,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn tags(&self) -> Vec<&str> {
        tags_of(&self.metadata)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags().contains(&tag)
    }

    /// 生产者是否要求保存处理结果
    pub fn wants_result_stored(&self) -> bool {
        self.metadata
            .get(METADATA_STORE_RESULT)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn can_retry(&self) -> bool {
        self.retry_attempt < self.max_retries
    }

    /// 校验状态流转，返回目标状态
    pub fn plan_transition(&self, transition: Transition) -> SchedulerResult<TaskStatus> {
        self.status
            .transition(transition)
            .ok_or_else(|| SchedulerError::InvalidTransition {
                task_id: self.id.to_string(),
                from: self.status.to_string(),
                to: transition.target().to_string(),
            })
    }
}

pub(crate) fn tags_of(metadata: &Map<String, Value>) -> Vec<&str> {
    metadata
        .get(METADATA_TAGS)
        .and_then(Value::as_array)
        .map(|tags| tags.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

/// 任务创建描述，由生产者提交
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewTask {
    pub name: String,
    pub description: Option<String>,
    pub task_type: String,
    pub parameters: Value,
    pub schedule_type: ScheduleType,
    pub priority: i32,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub max_retries: u32,
    pub metadata: Map<String, Value>,
}

impl Default for NewTask {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            task_type: String::new(),
            parameters: Value::Null,
            schedule_type: ScheduleType::Priority,
            priority: 0,
            scheduled_time: None,
            interval_ms: None,
            timeout_ms: None,
            max_retries: 0,
            metadata: Map::new(),
        }
    }
}

impl NewTask {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_type: task_type.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// 设为 EXACT_TIME 任务
    pub fn at(mut self, scheduled_time: DateTime<Utc>) -> Self {
        self.schedule_type = ScheduleType::ExactTime;
        self.scheduled_time = Some(scheduled_time);
        self
    }

    /// 设为 INTERVAL 任务
    pub fn every(mut self, interval_ms: u64) -> Self {
        self.schedule_type = ScheduleType::Interval;
        self.interval_ms = Some(interval_ms);
        self
    }

    pub fn starting_at(mut self, scheduled_time: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(scheduled_time);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags = tags.into_iter().map(|t| Value::String(t.into())).collect();
        self.metadata
            .insert(METADATA_TAGS.to_string(), Value::Array(tags));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// 要求成功后把处理结果写入 metadata.result
    pub fn store_result(self) -> Self {
        self.with_metadata(METADATA_STORE_RESULT, Value::Bool(true))
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::validation("任务名称不能为空"));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(SchedulerError::validation(format!(
                "任务名称长度不能超过 {MAX_NAME_LEN} 个字符"
            )));
        }
        if self.task_type.trim().is_empty() {
            return Err(SchedulerError::validation("任务类型不能为空"));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(SchedulerError::validation(format!(
                "最大重试次数不能超过 {MAX_RETRIES_LIMIT}"
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(SchedulerError::validation("执行超时必须大于0"));
        }

        match self.schedule_type {
            ScheduleType::Priority => {
                if self.scheduled_time.is_some() {
                    return Err(SchedulerError::validation(
                        "PRIORITY 任务不能指定 scheduled_time",
                    ));
                }
            }
            ScheduleType::ExactTime => {
                if self.scheduled_time.is_none() {
                    return Err(SchedulerError::validation(
                        "EXACT_TIME 任务必须指定 scheduled_time",
                    ));
                }
            }
            ScheduleType::Interval => match self.interval_ms {
                Some(interval) if interval > 0 => {}
                _ => {
                    return Err(SchedulerError::validation(
                        "INTERVAL 任务必须指定大于0的 interval_ms",
                    ))
                }
            },
        }
        if self.schedule_type != ScheduleType::Interval && self.interval_ms.is_some() {
            return Err(SchedulerError::validation(
                "只有 INTERVAL 任务可以指定 interval_ms",
            ));
        }

        if let Some(tags) = self.metadata.get(METADATA_TAGS) {
            let valid = tags
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false);
            if !valid {
                return Err(SchedulerError::validation(
                    "metadata.tags 必须是字符串数组",
                ));
            }
        }

        Ok(())
    }
}

/// 任务部分更新；嵌套 Option 中的 `Some(None)` 表示清空字段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub parameters: Option<Value>,
    pub priority: Option<i32>,
    pub status: Option<TaskStatus>,
    pub scheduled_time: Option<Option<DateTime<Utc>>>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub retry_attempt: Option<u32>,
    pub max_retries: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub metadata: Option<Map<String, Value>>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn last_executed_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_executed_at = Some(at);
        self
    }

    pub fn scheduled_time(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    pub fn retry_attempt(mut self, attempt: u32) -> Self {
        self.retry_attempt = Some(attempt);
        self
    }

    pub fn last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// 校验生产者可见字段
    pub fn validate(&self) -> SchedulerResult<()> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() || name.len() > MAX_NAME_LEN {
                return Err(SchedulerError::validation("任务名称无效"));
            }
        }
        if let Some(max_retries) = self.max_retries {
            if max_retries > MAX_RETRIES_LIMIT {
                return Err(SchedulerError::validation(format!(
                    "最大重试次数不能超过 {MAX_RETRIES_LIMIT}"
                )));
            }
        }
        if let (Some(attempt), Some(max_retries)) = (self.retry_attempt, self.max_retries) {
            if attempt > max_retries {
                return Err(SchedulerError::validation("重试次数不能超过最大重试次数"));
            }
        }
        if let Some(metadata) = &self.metadata {
            if let Some(tags) = metadata.get(METADATA_TAGS) {
                if !tags
                    .as_array()
                    .map(|items| items.iter().all(Value::is_string))
                    .unwrap_or(false)
                {
                    return Err(SchedulerError::validation(
                        "metadata.tags 必须是字符串数组",
                    ));
                }
            }
        }
        Ok(())
    }
}
