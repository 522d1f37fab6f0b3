use async_trait::async_trait;
use std::collections::HashMap;
use taskline_domain::{
    compare_records, now_millis, to_millis, RecordPatch, TaskFilter, TaskRecord, TaskStatus,
    TaskStore,
};
use taskline_errors::{SchedulerError, SchedulerResult};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation};
use crate::task_context;

/// 内存任务存储
///
/// 适用于测试和不需要持久化的嵌入式场景。写锁保证条件更新在进程内是原子的。
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    inner: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<String, StoredRecord>,
    next_seq: u64,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    record: TaskRecord,
    /// 插入顺序，用于同一毫秒创建的任务排序
    seq: u64,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> SchedulerResult<TaskRecord> {
        let mut state = self.inner.write().await;
        if state.records.contains_key(&record.id) {
            return Err(SchedulerError::store(format!(
                "创建任务时发生主键冲突: 任务ID {} 已存在",
                record.id
            )));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.records.insert(
            record.id.clone(),
            StoredRecord {
                record: record.clone(),
                seq,
            },
        );
        debug!("内存存储创建任务: {}", record.id);
        Ok(record)
    }

    async fn get(&self, id: &str) -> SchedulerResult<Option<TaskRecord>> {
        let state = self.inner.read().await;
        Ok(state.records.get(id).map(|stored| stored.record.clone()))
    }

    async fn find(&self, filter: &TaskFilter) -> SchedulerResult<Vec<TaskRecord>> {
        if filter.matches_nothing() {
            return Ok(Vec::new());
        }
        let state = self.inner.read().await;
        let mut matched: Vec<&StoredRecord> = state
            .records
            .values()
            .filter(|stored| stored.record.matches(filter))
            .collect();
        matched.sort_by(|a, b| {
            compare_records(filter.order, (&a.record, a.seq), (&b.record, b.seq))
        });

        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(matched
            .into_iter()
            .take(limit)
            .map(|stored| stored.record.clone())
            .collect())
    }

    async fn update(&self, id: &str, patch: &RecordPatch) -> SchedulerResult<TaskRecord> {
        let mut state = self.inner.write().await;
        let stored = state.records.get_mut(id).ok_or_else(|| {
            RepositoryErrorHelpers::task_not_found(&task_context!(
                RepositoryOperation::Update,
                task_id = id
            ))
        })?;
        stored.record.apply(patch, to_millis(now_millis()))?;
        Ok(stored.record.clone())
    }

    async fn update_if_status(
        &self,
        id: &str,
        expected: TaskStatus,
        patch: &RecordPatch,
    ) -> SchedulerResult<TaskRecord> {
        let mut state = self.inner.write().await;
        let context = task_context!(RepositoryOperation::ConditionalUpdate, task_id = id);
        let stored = state
            .records
            .get_mut(id)
            .ok_or_else(|| RepositoryErrorHelpers::task_not_found(&context))?;
        if stored.record.status != expected.as_str() {
            return Err(RepositoryErrorHelpers::concurrency_conflict(
                &context,
                expected.as_str(),
            ));
        }
        stored.record.apply(patch, to_millis(now_millis()))?;
        Ok(stored.record.clone())
    }

    async fn delete(&self, id: &str) -> SchedulerResult<bool> {
        let mut state = self.inner.write().await;
        Ok(state.records.remove(id).is_some())
    }

    async fn delete_if_status(&self, id: &str, expected: TaskStatus) -> SchedulerResult<bool> {
        let mut state = self.inner.write().await;
        let Some(stored) = state.records.get(id) else {
            return Ok(false);
        };
        if stored.record.status != expected.as_str() {
            let context = task_context!(RepositoryOperation::ConditionalDelete, task_id = id);
            return Err(RepositoryErrorHelpers::concurrency_conflict(
                &context,
                expected.as_str(),
            ));
        }
        state.records.remove(id);
        Ok(true)
    }

    async fn count_by_status(&self) -> SchedulerResult<HashMap<TaskStatus, u64>> {
        let state = self.inner.read().await;
        let mut counts = HashMap::new();
        for stored in state.records.values() {
            let status: TaskStatus = stored.record.status.parse()?;
            *counts.entry(status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn health_check(&self) -> SchedulerResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
