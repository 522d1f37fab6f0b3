use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use taskline_errors::SchedulerError;
use uuid::Uuid;

/// 任务唯一标识，创建后不可变
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SchedulerError::validation(format!("无效的任务ID '{s}': {e}")))
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// 调度类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleType {
    /// 资源允许即可执行，按优先级排序
    #[default]
    Priority,
    /// 到达 scheduled_time 后执行
    ExactTime,
    /// 按固定周期重复执行
    Interval,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Priority => "PRIORITY",
            ScheduleType::ExactTime => "EXACT_TIME",
            ScheduleType::Interval => "INTERVAL",
        }
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PRIORITY" => Ok(ScheduleType::Priority),
            "EXACT_TIME" => Ok(ScheduleType::ExactTime),
            "INTERVAL" => Ok(ScheduleType::Interval),
            _ => Err(SchedulerError::validation(format!("无效的调度类型: {s}"))),
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 状态机：返回合法流转的目标状态，非法流转返回 None
    pub fn transition(self, transition: Transition) -> Option<TaskStatus> {
        use TaskStatus::*;
        match (self, transition) {
            (Pending, Transition::Claim) => Some(Running),
            (Running, Transition::Complete) => Some(Completed),
            (Running, Transition::Rearm) => Some(Pending),
            (Running, Transition::Fail) => Some(Failed),
            // RUNNING -> FAILED -> PENDING 合并为一次写入
            (Running | Failed, Transition::Retry) => Some(Pending),
            (Pending, Transition::Cancel) => Some(Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELLED" => Ok(TaskStatus::Cancelled),
            _ => Err(SchedulerError::validation(format!("无效的任务状态: {s}"))),
        }
    }
}

/// 状态流转动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Claim,
    Complete,
    Rearm,
    Fail,
    Retry,
    Cancel,
}

impl Transition {
    /// 流转的目标状态
    pub fn target(&self) -> TaskStatus {
        match self {
            Transition::Claim => TaskStatus::Running,
            Transition::Complete => TaskStatus::Completed,
            Transition::Fail => TaskStatus::Failed,
            Transition::Cancel => TaskStatus::Cancelled,
            Transition::Rearm | Transition::Retry => TaskStatus::Pending,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transition::Claim => "claim",
            Transition::Complete => "complete",
            Transition::Rearm => "rearm",
            Transition::Fail => "fail",
            Transition::Retry => "retry",
            Transition::Cancel => "cancel",
        };
        f.write_str(name)
    }
}
