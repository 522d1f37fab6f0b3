use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use taskline::app::Application;
use taskline::cli::{execute_config_action, execute_task_action, Cli, Commands};
use taskline::shutdown::{wait_for_shutdown_signal, ShutdownManager};
use taskline::telemetry::{init_logging, init_metrics};
use taskline_config::AppConfig;
use tracing::{error, info, warn};

/// 应用关闭的最长等待时间（含任务排空）
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(35);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).with_context(|| {
        format!(
            "加载配置失败: {}",
            cli.config.as_deref().unwrap_or("<默认路径>")
        )
    })?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Task(task) => {
            let app = Application::new(config).await?;
            let output = execute_task_action(app.dispatcher(), task.action).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Commands::Config(cmd) => {
            print!("{}", execute_config_action(&config, cmd.action)?);
            Ok(())
        }
    }
}

async fn run(config: AppConfig) -> Result<()> {
    init_logging(&config.observability)?;
    init_metrics(&config.observability)?;

    info!("启动任务调度引擎");
    let app = Arc::new(Application::new(config).await?);
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
            shutdown_manager.shutdown().await;
        }
        result = &mut app_handle => {
            error!("调度器提前退出");
            return report_exit(result);
        }
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, app_handle).await {
        Ok(result) => report_exit(result)?,
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("任务调度引擎已退出");
    Ok(())
}

fn report_exit(result: Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(Ok(())) => {
            info!("应用已优雅关闭");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("应用运行失败: {e:#}");
            Err(e)
        }
        Err(e) => Err(anyhow::anyhow!("应用任务异常退出: {e}")),
    }
}
