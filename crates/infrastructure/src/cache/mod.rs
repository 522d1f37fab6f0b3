//! 仓储层读缓存
//!
//! 只缓存按ID读取的结果；任何写入都会刷新或移除对应条目。
//! 容量淘汰和 TTL 过期由 moka 负责，这里只额外统计命中率。

use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskline_domain::{Task, TaskId};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: u64,
}

/// 有界 TTL 缓存，容量为 0 时不缓存任何内容
pub struct TaskCache {
    inner: Option<Cache<TaskId, Task>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: Arc<AtomicU64>,
}

impl TaskCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let inner = (capacity > 0).then(|| {
            let counter = evictions.clone();
            Cache::builder()
                .max_capacity(capacity as u64)
                .time_to_live(ttl)
                .eviction_listener(move |_id, _task, cause| {
                    if cause.was_evicted() {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .build()
        });
        Self {
            inner,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions,
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub async fn get(&self, id: &TaskId) -> Option<Task> {
        let cache = self.inner.as_ref()?;
        let task = cache.get(id).await;
        let counter = if task.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        task
    }

    pub async fn put(&self, task: &Task) {
        if let Some(cache) = &self.inner {
            cache.insert(task.id, task.clone()).await;
        }
    }

    pub async fn invalidate(&self, id: &TaskId) {
        if let Some(cache) = &self.inner {
            cache.invalidate(id).await;
        }
    }

    /// 统计前先处理 moka 的挂起维护任务，使条目数和淘汰数是最新的
    pub async fn stats(&self) -> CacheStats {
        let entries = match &self.inner {
            Some(cache) => {
                cache.run_pending_tasks().await;
                cache.entry_count()
            }
            None => 0,
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries,
        }
    }
}
