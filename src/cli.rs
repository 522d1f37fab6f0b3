use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use taskline_config::AppConfig;
use taskline_dispatcher::{ScheduleEvaluator, TaskDispatcher};
use taskline_domain::{now_millis, NewTask, TaskFilter, TaskId, TaskOrder, TaskStatus};

/// 命令行入口
#[derive(Parser, Debug)]
#[command(name = "taskline")]
#[command(version)]
#[command(about = "持久化任务调度与执行引擎")]
pub struct Cli {
    /// 配置文件路径，未指定时依次查找 config/taskline.toml 和 taskline.toml
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行调度器直到收到 SIGINT/SIGTERM
    Run,
    /// 任务管理
    Task(TaskCommands),
    /// 配置管理
    Config(ConfigCommands),
}

#[derive(Args, Debug)]
pub struct TaskCommands {
    #[command(subcommand)]
    pub action: TaskActions,
}

#[derive(Subcommand, Debug)]
pub enum TaskActions {
    /// 创建任务
    Create(CreateTaskArgs),
    /// 列出任务
    List {
        /// 状态过滤 (PENDING/RUNNING/COMPLETED/FAILED/CANCELLED)
        #[arg(short, long)]
        status: Option<String>,
        /// 名称包含的子串
        #[arg(short, long)]
        name: Option<String>,
        /// 标签过滤，可重复
        #[arg(short, long)]
        tag: Vec<String>,
        /// 按优先级排序
        #[arg(long)]
        by_priority: bool,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// 查看任务详情，附带下一次到期时间
    Get { task_id: String },
    /// 取消待执行的任务
    Cancel { task_id: String },
    /// 删除任务
    Delete { task_id: String },
}

#[derive(Args, Debug, Clone)]
pub struct CreateTaskArgs {
    /// 任务名称
    #[arg(short, long)]
    pub name: String,
    /// 处理器类型
    #[arg(short = 'T', long = "type", default_value = "log")]
    pub task_type: String,
    #[arg(short, long)]
    pub description: Option<String>,
    /// 任务参数 (JSON格式)
    #[arg(short, long)]
    pub params: Option<String>,
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub priority: i32,
    /// 指定执行时间 (RFC 3339)，设置后为 EXACT_TIME 任务
    #[arg(long, conflicts_with = "every_ms")]
    pub at: Option<DateTime<Utc>>,
    /// 执行周期（毫秒），设置后为 INTERVAL 任务
    #[arg(long)]
    pub every_ms: Option<u64>,
    #[arg(short, long, default_value = "0")]
    pub retries: u32,
    /// 单次执行超时（毫秒）
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// 标签，可重复
    #[arg(short, long)]
    pub tag: Vec<String>,
    /// 成功后把处理结果写入 metadata.result
    #[arg(long)]
    pub store_result: bool,
}

#[derive(Args, Debug)]
pub struct ConfigCommands {
    #[command(subcommand)]
    pub action: ConfigActions,
}

#[derive(Subcommand, Debug)]
pub enum ConfigActions {
    /// 输出生效的配置
    Show,
}

impl CreateTaskArgs {
    pub fn into_new_task(self) -> Result<NewTask> {
        let mut task = NewTask::new(self.name, self.task_type)
            .with_priority(self.priority)
            .with_max_retries(self.retries);

        if let Some(params) = self.params {
            let parameters: Value =
                serde_json::from_str(&params).context("任务参数不是合法的JSON")?;
            task = task.with_parameters(parameters);
        }
        if let Some(description) = self.description {
            task = task.with_description(description);
        }
        if let Some(at) = self.at {
            task = task.at(at);
        }
        if let Some(every_ms) = self.every_ms {
            task = task.every(every_ms);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            task = task.with_timeout_ms(timeout_ms);
        }
        if !self.tag.is_empty() {
            task = task.with_tags(self.tag);
        }
        if self.store_result {
            task = task.store_result();
        }
        Ok(task)
    }
}

/// 执行任务子命令，返回要输出的 JSON
pub async fn execute_task_action(dispatcher: &TaskDispatcher, action: TaskActions) -> Result<Value> {
    match action {
        TaskActions::Create(args) => {
            let task = dispatcher.create_task(args.into_new_task()?).await?;
            Ok(serde_json::to_value(task)?)
        }
        TaskActions::List {
            status,
            name,
            tag,
            by_priority,
            limit,
        } => {
            let mut filter = TaskFilter::new().with_limit(limit);
            if let Some(status) = status {
                filter = filter.with_status(status.parse::<TaskStatus>()?);
            }
            if let Some(name) = name {
                filter = filter.with_name_contains(name);
            }
            for tag in tag {
                filter = filter.with_tag(tag);
            }
            if by_priority {
                filter = filter.ordered_by(TaskOrder::PriorityDesc);
            }
            let tasks = dispatcher.find_tasks(&filter).await?;
            Ok(serde_json::to_value(tasks)?)
        }
        TaskActions::Get { task_id } => {
            let id: TaskId = task_id.parse()?;
            let task = dispatcher
                .get_task(&id)
                .await?
                .with_context(|| format!("任务不存在: {id}"))?;
            let next_due_at = ScheduleEvaluator::next_due_at(&task, now_millis());
            let mut value = serde_json::to_value(task)?;
            if let Value::Object(fields) = &mut value {
                fields.insert("next_due_at".to_string(), json!(next_due_at));
            }
            Ok(value)
        }
        TaskActions::Cancel { task_id } => {
            let id: TaskId = task_id.parse()?;
            let task = dispatcher.cancel_task(&id).await?;
            Ok(serde_json::to_value(task)?)
        }
        TaskActions::Delete { task_id } => {
            let id: TaskId = task_id.parse()?;
            let deleted = dispatcher.delete_task(&id).await?;
            Ok(json!({ "id": id, "deleted": deleted }))
        }
    }
}

pub fn execute_config_action(config: &AppConfig, action: ConfigActions) -> Result<String> {
    match action {
        ConfigActions::Show => config.to_toml(),
    }
}
