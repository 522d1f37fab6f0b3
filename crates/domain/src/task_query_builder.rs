use crate::query::{TaskFilter, TaskOrder};

/// 查询参数
#[derive(Debug, Clone, PartialEq)]
pub enum TaskQueryParam {
    String(String),
    Int64(i64),
}

/// 根据过滤条件生成 SQLite 查询语句，基础设施层只负责绑定参数
pub struct TaskQueryBuilder;

pub const TASK_COLUMNS: &str = "id, name, description, task_type, parameters, schedule_type, \
    priority, status, scheduled_time, interval_ms, timeout_ms, created_at, updated_at, \
    last_executed_at, retry_attempt, max_retries, last_error, metadata, version";

impl TaskQueryBuilder {
    pub fn build_select_query(filter: &TaskFilter) -> (String, Vec<TaskQueryParam>) {
        let mut query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1=1");
        let mut params = Vec::new();

        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                query.push_str(" AND 0");
            } else {
                let placeholders = vec!["?"; ids.len()].join(", ");
                query.push_str(&format!(" AND id IN ({placeholders})"));
                params.extend(ids.iter().map(|id| TaskQueryParam::String(id.to_string())));
            }
        }

        if let Some(status) = filter.status {
            query.push_str(" AND status = ?");
            params.push(TaskQueryParam::String(status.as_str().to_string()));
        }

        if let Some(pattern) = &filter.name_contains {
            // instr 区分大小写，LIKE 在 SQLite 中不区分
            query.push_str(" AND instr(name, ?) > 0");
            params.push(TaskQueryParam::String(pattern.clone()));
        }

        for tag in &filter.tags {
            query.push_str(
                " AND EXISTS (SELECT 1 FROM json_each(tasks.metadata, '$.tags') WHERE json_each.value = ?)",
            );
            params.push(TaskQueryParam::String(tag.clone()));
        }

        if let Some(due_before) = filter.due_before {
            query.push_str(" AND (scheduled_time IS NULL OR scheduled_time <= ?)");
            params.push(TaskQueryParam::Int64(due_before.timestamp_millis()));
        }

        match filter.order {
            TaskOrder::CreatedAsc => query.push_str(" ORDER BY created_at ASC, rowid ASC"),
            TaskOrder::PriorityDesc => {
                query.push_str(" ORDER BY priority DESC, created_at ASC, rowid ASC")
            }
        }

        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(TaskQueryParam::Int64(limit.min(i64::MAX as usize) as i64));
        }

        (query, params)
    }

    pub fn build_count_by_status_query() -> &'static str {
        "SELECT status, COUNT(*) AS count FROM tasks GROUP BY status"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_objects::{TaskId, TaskStatus};

    #[test]
    fn test_empty_filter() {
        let (query, params) = TaskQueryBuilder::build_select_query(&TaskFilter::new());
        assert!(query.ends_with("ORDER BY created_at ASC, rowid ASC"));
        assert!(params.is_empty());
    }

    #[test]
    fn test_full_filter() {
        let id = TaskId::new();
        let filter = TaskFilter::by_ids([id])
            .with_status(TaskStatus::Pending)
            .with_name_contains("report")
            .with_tag("daily")
            .with_tag("ops")
            .ordered_by(TaskOrder::PriorityDesc)
            .with_limit(10);
        let (query, params) = TaskQueryBuilder::build_select_query(&filter);

        assert!(query.contains("id IN (?)"));
        assert!(query.contains("status = ?"));
        assert!(query.contains("instr(name, ?)"));
        assert_eq!(query.matches("json_each").count(), 4);
        assert!(query.contains("ORDER BY priority DESC"));
        assert_eq!(
            params,
            vec![
                TaskQueryParam::String(id.to_string()),
                TaskQueryParam::String("PENDING".to_string()),
                TaskQueryParam::String("report".to_string()),
                TaskQueryParam::String("daily".to_string()),
                TaskQueryParam::String("ops".to_string()),
                TaskQueryParam::Int64(10),
            ]
        );
    }

    #[test]
    fn test_empty_id_list_matches_nothing() {
        let filter = TaskFilter::by_ids(Vec::new());
        assert!(filter.matches_nothing());
        let (query, params) = TaskQueryBuilder::build_select_query(&filter);
        assert!(query.contains("AND 0"));
        assert!(params.is_empty());
    }
}
