//! 调度判定
//!
//! 纯函数，不访问存储也不读取系统时钟，`now` 由调用方传入。

use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use taskline_domain::{ScheduleType, Task, TaskStatus};

pub struct ScheduleEvaluator;

impl ScheduleEvaluator {
    /// 任务在 `now` 时刻是否可以派发；只有 PENDING 任务可能到期
    pub fn is_due(task: &Task, now: DateTime<Utc>) -> bool {
        if task.status != TaskStatus::Pending {
            return false;
        }
        match Self::due_at(task) {
            Some(due_at) => now >= due_at,
            None => true,
        }
    }

    /// 同时到期的任务之间的派发顺序：优先级降序，创建时间升序
    pub fn compare_priority(a: &Task, b: &Task) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    }

    /// 任务最早可派发的时刻，None 表示立即可派发
    ///
    /// - PRIORITY: scheduled_time（仅在重试退避时设置）
    /// - EXACT_TIME: scheduled_time
    /// - INTERVAL: max(last_executed_at + interval, scheduled_time)
    pub fn due_at(task: &Task) -> Option<DateTime<Utc>> {
        match task.schedule_type {
            ScheduleType::Priority | ScheduleType::ExactTime => task.scheduled_time,
            ScheduleType::Interval => {
                let next_period = match (task.last_executed_at, task.interval_ms) {
                    (Some(last), Some(interval)) => Some(Self::add_interval(last, interval)),
                    _ => None,
                };
                match (next_period, task.scheduled_time) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                }
            }
        }
    }

    /// 非终态任务的下一次到期时刻
    pub fn next_due_at(task: &Task, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if task.status.is_terminal() {
            return None;
        }
        Some(Self::due_at(task).map_or(now, |due| due.max(now)))
    }

    /// `last + interval_ms`，溢出时取最大时刻
    pub fn add_interval(last: DateTime<Utc>, interval_ms: u64) -> DateTime<Utc> {
        i64::try_from(interval_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .and_then(|interval| last.checked_add_signed(interval))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
