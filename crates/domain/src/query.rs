use chrono::{DateTime, Utc};

use crate::value_objects::{TaskId, TaskStatus};

/// 结果排序方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskOrder {
    /// 创建时间升序
    #[default]
    CreatedAsc,
    /// 优先级降序，同优先级按创建时间升序
    PriorityDesc,
}

/// 任务查询条件，所有条件之间为 AND 关系
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    /// 显式ID列表；空列表不匹配任何任务
    pub ids: Option<Vec<TaskId>>,
    /// 名称子串（区分大小写）
    pub name_contains: Option<String>,
    pub status: Option<TaskStatus>,
    /// metadata.tags 必须包含全部标签
    pub tags: Vec<String>,
    /// scheduled_time 为空或不晚于该时刻
    pub due_before: Option<DateTime<Utc>>,
    pub order: TaskOrder,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_ids(ids: impl IntoIterator<Item = TaskId>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_name_contains(mut self, pattern: impl Into<String>) -> Self {
        self.name_contains = Some(pattern.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn due_before(mut self, instant: DateTime<Utc>) -> Self {
        self.due_before = Some(instant);
        self
    }

    pub fn ordered_by(mut self, order: TaskOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// 空ID列表或 limit=0 时无需访问存储
    pub fn matches_nothing(&self) -> bool {
        matches!(&self.ids, Some(ids) if ids.is_empty()) || self.limit == Some(0)
    }
}
