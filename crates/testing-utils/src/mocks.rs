//! Test doubles for the store boundary and for handler instrumentation

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskline_domain::{RecordPatch, TaskFilter, TaskRecord, TaskStatus, TaskStore};
use taskline_errors::{SchedulerError, SchedulerResult};

/// Which store operation a failure is injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Insert,
    Get,
    Find,
    Update,
    ConditionalUpdate,
    Delete,
    ConditionalDelete,
}

/// Wraps a real `TaskStore`; fails the next N calls of selected operations
/// and can delay selected operations to widen race windows
pub struct FlakyTaskStore {
    inner: Arc<dyn TaskStore>,
    pending_failures: Mutex<HashMap<StoreOperation, usize>>,
    latencies: Mutex<HashMap<StoreOperation, Duration>>,
    unhealthy: AtomicBool,
    injected: AtomicUsize,
}

impl FlakyTaskStore {
    pub fn new(inner: Arc<dyn TaskStore>) -> Self {
        Self {
            inner,
            pending_failures: Mutex::new(HashMap::new()),
            latencies: Mutex::new(HashMap::new()),
            unhealthy: AtomicBool::new(false),
            injected: AtomicUsize::new(0),
        }
    }

    /// The next `count` calls of `operation` fail with a store error
    pub fn fail_next(&self, operation: StoreOperation, count: usize) {
        let mut failures = self.lock_failures();
        *failures.entry(operation).or_insert(0) += count;
    }

    /// Every call of `operation` sleeps for `latency` before reaching the inner store
    pub fn set_latency(&self, operation: StoreOperation, latency: Duration) {
        match self.latencies.lock() {
            Ok(mut latencies) => latencies.insert(operation, latency),
            Err(poisoned) => poisoned.into_inner().insert(operation, latency),
        };
    }

    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    /// Number of failures injected so far
    pub fn injected_failures(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    async fn check(&self, operation: StoreOperation) -> SchedulerResult<()> {
        let latency = match self.latencies.lock() {
            Ok(latencies) => latencies.get(&operation).copied(),
            Err(poisoned) => poisoned.into_inner().get(&operation).copied(),
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.take_failure(operation)
    }

    fn take_failure(&self, operation: StoreOperation) -> SchedulerResult<()> {
        let mut failures = self.lock_failures();
        match failures.get_mut(&operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                self.injected.fetch_add(1, Ordering::SeqCst);
                Err(SchedulerError::store(format!(
                    "injected failure: {operation:?}"
                )))
            }
            _ => Ok(()),
        }
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, HashMap<StoreOperation, usize>> {
        match self.pending_failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl TaskStore for FlakyTaskStore {
    async fn insert(&self, record: TaskRecord) -> SchedulerResult<TaskRecord> {
        self.check(StoreOperation::Insert).await?;
        self.inner.insert(record).await
    }

    async fn get(&self, id: &str) -> SchedulerResult<Option<TaskRecord>> {
        self.check(StoreOperation::Get).await?;
        self.inner.get(id).await
    }

    async fn find(&self, filter: &TaskFilter) -> SchedulerResult<Vec<TaskRecord>> {
        self.check(StoreOperation::Find).await?;
        self.inner.find(filter).await
    }

    async fn update(&self, id: &str, patch: &RecordPatch) -> SchedulerResult<TaskRecord> {
        self.check(StoreOperation::Update).await?;
        self.inner.update(id, patch).await
    }

    async fn update_if_status(
        &self,
        id: &str,
        expected: TaskStatus,
        patch: &RecordPatch,
    ) -> SchedulerResult<TaskRecord> {
        self.check(StoreOperation::ConditionalUpdate).await?;
        self.inner.update_if_status(id, expected, patch).await
    }

    async fn delete(&self, id: &str) -> SchedulerResult<bool> {
        self.check(StoreOperation::Delete).await?;
        self.inner.delete(id).await
    }

    async fn delete_if_status(&self, id: &str, expected: TaskStatus) -> SchedulerResult<bool> {
        self.check(StoreOperation::ConditionalDelete).await?;
        self.inner.delete_if_status(id, expected).await
    }

    async fn count_by_status(&self) -> SchedulerResult<HashMap<TaskStatus, u64>> {
        self.inner.count_by_status().await
    }

    async fn health_check(&self) -> SchedulerResult<()> {
        if self.unhealthy.load(Ordering::SeqCst) {
            return Err(SchedulerError::store("injected failure: health check"));
        }
        self.inner.health_check().await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

/// Records handler executions: start order and peak concurrency
#[derive(Default)]
pub struct ExecutionTracker {
    started: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ExecutionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks an execution as started; the returned guard marks it finished on drop
    pub fn enter(self: &Arc<Self>, label: impl Into<String>) -> TrackerGuard {
        match self.started.lock() {
            Ok(mut started) => started.push(label.into()),
            Err(poisoned) => poisoned.into_inner().push(label.into()),
        }
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        TrackerGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn started(&self) -> Vec<String> {
        match self.started.lock() {
            Ok(started) => started.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self) -> usize {
        self.started().len()
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct TrackerGuard {
    tracker: Arc<ExecutionTracker>,
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        self.tracker.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_records_peak_concurrency() {
        let tracker = ExecutionTracker::new();
        let a = tracker.enter("a");
        let b = tracker.enter("b");
        assert_eq!(tracker.running(), 2);
        drop(a);
        drop(b);
        let _c = tracker.enter("c");

        assert_eq!(tracker.peak(), 2);
        assert_eq!(tracker.running(), 1);
        assert_eq!(tracker.started(), vec!["a", "b", "c"]);
    }
}
