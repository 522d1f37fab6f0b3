use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use taskline_config::StoreConfig;
use taskline_domain::{
    now_millis, to_millis, RecordPatch, TaskFilter, TaskQueryBuilder, TaskQueryParam, TaskRecord,
    TaskStatus, TaskStore, TASK_COLUMNS,
};
use taskline_errors::SchedulerResult;
use tracing::{debug, info, instrument};

use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation, TaskOperationContext};
use crate::task_context;

/// 基于 SQLite 的任务存储
///
/// 状态流转通过 `UPDATE ... WHERE id = ? AND status = ?` 实现比较并设置，
/// 多个调度实例共享同一数据库文件时也只有一个能认领成功。
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// 使用已有连接池，调用方负责执行迁移
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 按配置建立连接池并初始化表结构
    pub async fn connect(config: &StoreConfig) -> SchedulerResult<Self> {
        let context = task_context!(RepositoryOperation::Migrate)
            .with_additional_info(format!("连接 {}", config.url));

        let connect_options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| RepositoryErrorHelpers::store_error(&context, e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(connect_options)
            .await
            .map_err(|e| RepositoryErrorHelpers::store_error(&context, e))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite任务存储已就绪: {}", config.url);
        Ok(store)
    }

    /// 以默认连接参数打开数据库文件
    pub async fn new_embedded(database_path: &str) -> SchedulerResult<Self> {
        let url = if database_path.starts_with("sqlite:") {
            database_path.to_string()
        } else {
            format!("sqlite:{database_path}")
        };
        Self::connect(&StoreConfig {
            url,
            ..StoreConfig::default()
        })
        .await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn run_migrations(&self) -> SchedulerResult<()> {
        debug!("执行SQLite数据库迁移");
        let context = task_context!(RepositoryOperation::Migrate);

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                task_type TEXT NOT NULL,
                parameters TEXT NOT NULL DEFAULT 'null',
                schedule_type TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'PENDING',
                scheduled_time INTEGER,
                interval_ms INTEGER,
                timeout_ms INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_executed_at INTEGER,
                retry_attempt INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                version INTEGER NOT NULL DEFAULT 1,
                CHECK (retry_attempt >= 0 AND retry_attempt <= max_retries),
                CHECK (created_at <= updated_at)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_tasks_status_scheduled ON tasks(status, scheduled_time)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_priority_created ON tasks(priority DESC, created_at ASC)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at)",
        ];

        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| RepositoryErrorHelpers::store_error(&context, e))?;
        }

        debug!("SQLite数据库迁移完成");
        Ok(())
    }

    fn row_to_record(row: &SqliteRow, context: &TaskOperationContext) -> SchedulerResult<TaskRecord> {
        let map_err = |e: sqlx::Error| RepositoryErrorHelpers::store_error(context, e);

        let parameters: String = row.try_get("parameters").map_err(map_err)?;
        let metadata: String = row.try_get("metadata").map_err(map_err)?;

        Ok(TaskRecord {
            id: row.try_get("id").map_err(map_err)?,
            name: row.try_get("name").map_err(map_err)?,
            description: row.try_get("description").map_err(map_err)?,
            task_type: row.try_get("task_type").map_err(map_err)?,
            parameters: serde_json::from_str(&parameters)
                .map_err(|e| RepositoryErrorHelpers::serialization_error(context, e))?,
            schedule_type: row.try_get("schedule_type").map_err(map_err)?,
            priority: row.try_get("priority").map_err(map_err)?,
            status: row.try_get("status").map_err(map_err)?,
            scheduled_time: row.try_get("scheduled_time").map_err(map_err)?,
            interval_ms: row.try_get("interval_ms").map_err(map_err)?,
            timeout_ms: row.try_get("timeout_ms").map_err(map_err)?,
            created_at: row.try_get("created_at").map_err(map_err)?,
            updated_at: row.try_get("updated_at").map_err(map_err)?,
            last_executed_at: row.try_get("last_executed_at").map_err(map_err)?,
            retry_attempt: row.try_get("retry_attempt").map_err(map_err)?,
            max_retries: row.try_get("max_retries").map_err(map_err)?,
            last_error: row.try_get("last_error").map_err(map_err)?,
            metadata: serde_json::from_str(&metadata)
                .map_err(|e| RepositoryErrorHelpers::serialization_error(context, e))?,
            version: row.try_get("version").map_err(map_err)?,
        })
    }

    /// 执行补丁写入；`expected` 为 Some 时附加状态条件
    async fn apply_patch(
        &self,
        id: &str,
        expected: Option<TaskStatus>,
        patch: &RecordPatch,
        context: &TaskOperationContext,
    ) -> SchedulerResult<TaskRecord> {
        let now_ms = to_millis(now_millis());
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE tasks SET version = version + 1, updated_at = MAX(updated_at, ");
        builder.push_bind(now_ms);
        builder.push(")");

        if let Some(name) = &patch.name {
            builder.push(", name = ").push_bind(name.clone());
        }
        if let Some(description) = &patch.description {
            builder.push(", description = ").push_bind(description.clone());
        }
        if let Some(parameters) = &patch.parameters {
            let json = serde_json::to_string(parameters)
                .map_err(|e| RepositoryErrorHelpers::serialization_error(context, e))?;
            builder.push(", parameters = ").push_bind(json);
        }
        if let Some(priority) = patch.priority {
            builder.push(", priority = ").push_bind(priority);
        }
        if let Some(status) = &patch.status {
            builder.push(", status = ").push_bind(status.clone());
        }
        if let Some(scheduled_time) = patch.scheduled_time {
            builder.push(", scheduled_time = ").push_bind(scheduled_time);
        }
        if let Some(last_executed_at) = patch.last_executed_at {
            builder.push(", last_executed_at = ").push_bind(last_executed_at);
        }
        if let Some(retry_attempt) = patch.retry_attempt {
            builder.push(", retry_attempt = ").push_bind(retry_attempt);
        }
        if let Some(max_retries) = patch.max_retries {
            builder.push(", max_retries = ").push_bind(max_retries);
        }
        if let Some(last_error) = &patch.last_error {
            builder.push(", last_error = ").push_bind(last_error.clone());
        }
        if let Some(metadata) = &patch.metadata {
            let json = serde_json::to_string(metadata)
                .map_err(|e| RepositoryErrorHelpers::serialization_error(context, e))?;
            builder.push(", metadata = ").push_bind(json);
        }

        builder.push(" WHERE id = ").push_bind(id.to_string());
        if let Some(expected) = expected {
            builder.push(" AND status = ").push_bind(expected.as_str());
        }
        builder.push(" RETURNING ");
        builder.push(TASK_COLUMNS);

        let row = builder
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::store_error(context, e))?;

        match row {
            Some(row) => {
                let record = Self::row_to_record(&row, context)?;
                RepositoryErrorHelpers::log_operation_success(
                    context,
                    Some(&format!("状态: {}, 版本: {}", record.status, record.version)),
                );
                Ok(record)
            }
            None => match expected {
                Some(expected) if self.exists(id, context).await? => Err(
                    RepositoryErrorHelpers::concurrency_conflict(context, expected.as_str()),
                ),
                _ => Err(RepositoryErrorHelpers::task_not_found(context)),
            },
        }
    }

    async fn exists(&self, id: &str, context: &TaskOperationContext) -> SchedulerResult<bool> {
        let row = sqlx::query("SELECT 1 FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::store_error(context, e))?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    #[instrument(skip(self, record), fields(task_id = %record.id, task_name = %record.name))]
    async fn insert(&self, record: TaskRecord) -> SchedulerResult<TaskRecord> {
        let context = task_context!(
            RepositoryOperation::Create,
            task_id = record.id,
            task_name = record.name
        );

        let parameters = serde_json::to_string(&record.parameters)
            .map_err(|e| RepositoryErrorHelpers::serialization_error(&context, e))?;
        let metadata = serde_json::to_string(&record.metadata)
            .map_err(|e| RepositoryErrorHelpers::serialization_error(&context, e))?;

        let sql = format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(&record.id)
            .bind(&record.name)
            .bind(&record.description)
            .bind(&record.task_type)
            .bind(parameters)
            .bind(&record.schedule_type)
            .bind(record.priority)
            .bind(&record.status)
            .bind(record.scheduled_time)
            .bind(record.interval_ms)
            .bind(record.timeout_ms)
            .bind(record.created_at)
            .bind(record.updated_at)
            .bind(record.last_executed_at)
            .bind(record.retry_attempt)
            .bind(record.max_retries)
            .bind(&record.last_error)
            .bind(metadata)
            .bind(record.version)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::store_error(&context, e))?;

        RepositoryErrorHelpers::log_operation_success(
            &context,
            Some(&format!("类型: {}", record.task_type)),
        );
        Ok(record)
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn get(&self, id: &str) -> SchedulerResult<Option<TaskRecord>> {
        let context = task_context!(RepositoryOperation::Read, task_id = id);
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::store_error(&context, e))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_record(&row, &context)?)),
            None => {
                debug!("查询任务不存在: ID {}", id);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, filter))]
    async fn find(&self, filter: &TaskFilter) -> SchedulerResult<Vec<TaskRecord>> {
        if filter.matches_nothing() {
            return Ok(Vec::new());
        }
        let context = task_context!(RepositoryOperation::Query);
        let (sql, params) = TaskQueryBuilder::build_select_query(filter);

        let mut query = sqlx::query(&sql);
        for param in params {
            query = match param {
                TaskQueryParam::String(value) => query.bind(value),
                TaskQueryParam::Int64(value) => query.bind(value),
            };
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::store_error(&context, e))?;

        let records = rows
            .iter()
            .map(|row| Self::row_to_record(row, &context))
            .collect::<SchedulerResult<Vec<_>>>()?;
        debug!("条件查询返回 {} 个任务", records.len());
        Ok(records)
    }

    #[instrument(skip(self, patch), fields(task_id = %id))]
    async fn update(&self, id: &str, patch: &RecordPatch) -> SchedulerResult<TaskRecord> {
        let context = task_context!(RepositoryOperation::Update, task_id = id);
        self.apply_patch(id, None, patch, &context).await
    }

    #[instrument(skip(self, patch), fields(task_id = %id, expected = %expected))]
    async fn update_if_status(
        &self,
        id: &str,
        expected: TaskStatus,
        patch: &RecordPatch,
    ) -> SchedulerResult<TaskRecord> {
        let context = task_context!(RepositoryOperation::ConditionalUpdate, task_id = id);
        self.apply_patch(id, Some(expected), patch, &context).await
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn delete(&self, id: &str) -> SchedulerResult<bool> {
        let context = task_context!(RepositoryOperation::Delete, task_id = id);
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::store_error(&context, e))?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            RepositoryErrorHelpers::log_operation_success(&context, None);
        }
        Ok(deleted)
    }

    #[instrument(skip(self), fields(task_id = %id, expected = %expected))]
    async fn delete_if_status(&self, id: &str, expected: TaskStatus) -> SchedulerResult<bool> {
        let context = task_context!(RepositoryOperation::ConditionalDelete, task_id = id);
        let result = sqlx::query("DELETE FROM tasks WHERE id = ? AND status = ?")
            .bind(id)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::store_error(&context, e))?;

        if result.rows_affected() > 0 {
            RepositoryErrorHelpers::log_operation_success(&context, None);
            return Ok(true);
        }
        if self.exists(id, &context).await? {
            return Err(RepositoryErrorHelpers::concurrency_conflict(
                &context,
                expected.as_str(),
            ));
        }
        Ok(false)
    }

    async fn count_by_status(&self) -> SchedulerResult<HashMap<TaskStatus, u64>> {
        let context = task_context!(RepositoryOperation::Query)
            .with_additional_info("按状态统计任务数量");
        let rows = sqlx::query(TaskQueryBuilder::build_count_by_status_query())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::store_error(&context, e))?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| RepositoryErrorHelpers::store_error(&context, e))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| RepositoryErrorHelpers::store_error(&context, e))?;
            counts.insert(status.parse::<TaskStatus>()?, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn health_check(&self) -> SchedulerResult<()> {
        let context = task_context!(RepositoryOperation::HealthCheck);
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::store_error(&context, e))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
