use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use taskline_config::RepositoryConfig;
use taskline_domain::{
    now_millis, NewTask, Task, TaskFilter, TaskId, TaskPatch, TaskStatus, TaskStore, Transition,
};
use taskline_errors::{SchedulerError, SchedulerResult};
use tracing::{debug, info, instrument};

use crate::cache::{CacheStats, TaskCache};
use crate::database::MappingHelpers;

/// 任务仓储
///
/// 负责领域实体与存储记录的转换，以及按ID读取的缓存。不包含业务逻辑，也不做内部重试。
/// 状态流转直接走存储层的条件更新，不经过缓存。
pub struct TaskRepository {
    store: Arc<dyn TaskStore>,
    cache: TaskCache,
}

impl TaskRepository {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            cache: TaskCache::disabled(),
        }
    }

    pub fn with_config(store: Arc<dyn TaskStore>, config: &RepositoryConfig) -> Self {
        Self {
            store,
            cache: TaskCache::new(
                config.cache_capacity,
                Duration::from_millis(config.cache_ttl_ms),
            ),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    #[instrument(skip(self, new_task), fields(task_name = %new_task.name, task_type = %new_task.task_type))]
    pub async fn create(&self, new_task: NewTask) -> SchedulerResult<Task> {
        new_task.validate()?;

        let now = now_millis();
        let task = Task {
            id: TaskId::new(),
            name: new_task.name,
            description: new_task.description,
            task_type: new_task.task_type,
            parameters: new_task.parameters,
            schedule_type: new_task.schedule_type,
            priority: new_task.priority,
            status: TaskStatus::Pending,
            scheduled_time: new_task.scheduled_time,
            interval_ms: new_task.interval_ms,
            timeout_ms: new_task.timeout_ms,
            created_at: now,
            updated_at: now,
            last_executed_at: None,
            retry_attempt: 0,
            max_retries: new_task.max_retries,
            last_error: None,
            metadata: new_task.metadata,
            version: 1,
        };

        let record = self
            .store
            .insert(MappingHelpers::task_to_record(&task))
            .await?;
        let created = MappingHelpers::record_to_task(record)?;
        self.cache.put(&created).await;
        info!(
            task_id = %created.id,
            schedule_type = %created.schedule_type,
            "创建任务成功: {}",
            created.name
        );
        Ok(created)
    }

    pub async fn get_by_id(&self, id: &TaskId) -> SchedulerResult<Option<Task>> {
        if let Some(task) = self.cache.get(id).await {
            debug!("任务缓存命中: {}", id);
            return Ok(Some(task));
        }
        let task = self.get_fresh(id).await?;
        if let Some(task) = &task {
            self.cache.put(task).await;
        }
        Ok(task)
    }

    /// 绕过缓存直接读取存储
    pub async fn get_fresh(&self, id: &TaskId) -> SchedulerResult<Option<Task>> {
        self.store
            .get(&id.to_string())
            .await?
            .map(MappingHelpers::record_to_task)
            .transpose()
    }

    pub async fn find(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        self.store
            .find(filter)
            .await?
            .into_iter()
            .map(MappingHelpers::record_to_task)
            .collect()
    }

    /// 更新生产者可见字段；状态只能通过 `transition` 修改
    #[instrument(skip(self, patch), fields(task_id = %id))]
    pub async fn update(&self, id: &TaskId, patch: TaskPatch) -> SchedulerResult<Task> {
        if patch.status.is_some() {
            return Err(SchedulerError::validation(
                "任务状态只能通过状态流转修改",
            ));
        }
        patch.validate()?;

        let result = self
            .store
            .update(&id.to_string(), &MappingHelpers::patch_to_record_patch(&patch))
            .await;
        self.refresh_cache(id, result).await
    }

    /// 执行状态流转：先校验状态机，再以当前状态为条件写入存储
    #[instrument(skip(self, task, patch), fields(task_id = %task.id, from = %task.status, transition = %transition))]
    pub async fn transition(
        &self,
        task: &Task,
        transition: Transition,
        patch: TaskPatch,
    ) -> SchedulerResult<Task> {
        let target = task.plan_transition(transition)?;
        let patch = patch.status(target);

        let result = self
            .store
            .update_if_status(
                &task.id.to_string(),
                task.status,
                &MappingHelpers::patch_to_record_patch(&patch),
            )
            .await;
        let updated = self.refresh_cache(&task.id, result).await?;
        debug!("任务状态流转: {} -> {}", task.status, updated.status);
        Ok(updated)
    }

    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn delete(&self, id: &TaskId) -> SchedulerResult<bool> {
        self.cache.invalidate(id).await;
        let deleted = self.store.delete(&id.to_string()).await?;
        if deleted {
            info!("删除任务: {}", id);
        }
        Ok(deleted)
    }

    /// 仅当任务仍处于 `expected` 状态时删除
    #[instrument(skip(self), fields(task_id = %id, expected = %expected))]
    pub async fn delete_if_status(&self, id: &TaskId, expected: TaskStatus) -> SchedulerResult<bool> {
        self.cache.invalidate(id).await;
        let deleted = self
            .store
            .delete_if_status(&id.to_string(), expected)
            .await?;
        if deleted {
            info!("删除任务: {}", id);
        }
        Ok(deleted)
    }

    pub async fn count_by_status(&self) -> SchedulerResult<HashMap<TaskStatus, u64>> {
        self.store.count_by_status().await
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        self.store.health_check().await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    async fn refresh_cache(
        &self,
        id: &TaskId,
        result: SchedulerResult<taskline_domain::TaskRecord>,
    ) -> SchedulerResult<Task> {
        match result.and_then(MappingHelpers::record_to_task) {
            Ok(task) => {
                self.cache.put(&task).await;
                Ok(task)
            }
            Err(e) => {
                self.cache.invalidate(id).await;
                Err(e)
            }
        }
    }
}
