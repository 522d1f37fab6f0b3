use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use taskline_config::AppConfig;
use taskline_dispatcher::{FailureObserver, HandlerRegistry, TaskContext, TaskDispatcher};
use taskline_domain::Task;
use taskline_infrastructure::{create_task_store, TaskRepository};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// 停止调度后等待进行中任务结束的上限
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// 宿主进程：持有调度器并管理其生命周期
pub struct Application {
    config: AppConfig,
    dispatcher: Arc<TaskDispatcher>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序，存储后端: {:?}", config.store.backend);

        let store = create_task_store(&config.store)
            .await
            .context("创建任务存储失败")?;
        let repository = Arc::new(TaskRepository::with_config(store, &config.repository));

        let registry = Arc::new(HandlerRegistry::new());
        register_builtin_handlers(&registry).await;

        let dispatcher = Arc::new(TaskDispatcher::new(repository, registry));
        dispatcher.register_failure_observer(Arc::new(LoggingFailureObserver));

        Ok(Self { config, dispatcher })
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 运行调度器直到收到关闭信号，然后停止调度并等待进行中的任务
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.dispatcher
            .initialize(self.config.dispatcher.clone())
            .await
            .context("初始化调度器失败")?;
        self.dispatcher
            .start_scheduler()
            .await
            .context("启动调度器失败")?;

        let _ = shutdown_rx.recv().await;
        info!("开始停止调度器");

        self.dispatcher
            .stop_scheduler()
            .await
            .context("停止调度器失败")?;
        if !self.dispatcher.wait_idle(DRAIN_TIMEOUT).await {
            warn!(
                "等待进行中任务超时，仍有 {} 个任务在执行",
                self.dispatcher.in_flight()
            );
        }
        Ok(())
    }
}

/// 注册内置处理器：`noop` 直接成功，`log` 记录参数并原样返回
pub async fn register_builtin_handlers(registry: &HandlerRegistry) {
    registry
        .register_fn("noop", |_ctx: TaskContext| async move {
            Ok::<_, anyhow::Error>(None)
        })
        .await;
    registry
        .register_fn("log", |ctx: TaskContext| async move {
            info!(
                task_id = %ctx.task_id,
                task_name = %ctx.name,
                parameters = %ctx.parameters,
                "执行日志任务"
            );
            Ok::<_, anyhow::Error>(Some(ctx.parameters))
        })
        .await;
}

/// 把最终失败的任务写入错误日志
struct LoggingFailureObserver;

#[async_trait]
impl FailureObserver for LoggingFailureObserver {
    async fn on_task_failed(&self, task: &Task, error: &str) {
        error!(
            task_id = %task.id,
            task_name = %task.name,
            task_type = %task.task_type,
            retry_attempt = task.retry_attempt,
            "任务最终失败: {}",
            error
        );
    }
}
