use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use flowscribe::models::config::CaptureConfig;
use flowscribe::services::tail::{run_tail, TailOptions};
use flowscribe::services::{build_sinks, CapturePipeline, ProxyInstance, SinkDispatcher, SinkSet};
use flowscribe::utils::{init_logger, LogConfig, LogLevel};

#[derive(Debug, Parser)]
#[command(name = "flowscribe")]
#[command(about = "Capture LLM API traffic into structured conversation records", version)]
struct Cli {
    /// 配置文件（默认 ~/.flowscribe/config.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// 启动转发代理并采集流量
    Serve(ServeArgs),
    /// 查看追加写入的流量流
    Tail(TailArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    upstream: Option<String>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct TailArgs {
    /// 流量流文件（默认使用配置中的路径）
    path: Option<PathBuf>,
    /// 先显示的历史条数
    #[arg(short = 'n', long = "lines", default_value_t = 10)]
    lines: usize,
    /// 只显示历史，不跟随
    #[arg(long)]
    no_follow: bool,
    /// 只跟随，不显示历史
    #[arg(short = 'f', long)]
    follow_only: bool,
    /// 展开显示正文
    #[arg(short = 'x', long)]
    expand: bool,
    #[arg(long)]
    no_color: bool,
}

impl ServeArgs {
    fn apply(self, config: &mut CaptureConfig) {
        if let Some(listen) = self.listen {
            config.proxy.listen = listen;
        }
        if let Some(upstream) = self.upstream {
            config.proxy.upstream = upstream;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = Some(dir);
        }
    }
}

impl TailArgs {
    fn options(&self) -> TailOptions {
        TailOptions {
            count: if self.follow_only { 0 } else { self.lines },
            follow: !self.no_follow,
            expand: self.expand,
            color: !self.no_color,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CaptureConfig::load(cli.config.as_deref()).context("加载配置失败")?;

    match cli.command {
        Commands::Serve(args) => {
            args.apply(&mut config);
            config.validate().context("配置校验失败")?;

            let _guard = init_logger(&LogConfig::from_section(&config.log)?)?;
            serve(config).await
        }
        Commands::Tail(args) => {
            // tail 的输出在 stdout，日志只保留警告
            let _guard = init_logger(&LogConfig {
                level: LogLevel::Warn,
                ..Default::default()
            })?;
            let path = args.path.clone().unwrap_or_else(|| config.stream_path());

            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c_cancel.cancel();
                }
            });

            run_tail(path, args.options(), cancel).await?;
            Ok(())
        }
    }
}

async fn serve(config: CaptureConfig) -> Result<()> {
    let SinkSet { sinks, quota } = build_sinks(&config).context("初始化 Sink 失败")?;
    let dispatcher = Arc::new(
        SinkDispatcher::new(sinks, Duration::from_millis(config.dispatch.timeout_ms))
            .spawn(config.dispatch.queue_capacity),
    );
    let mut pipeline = CapturePipeline::new(&config, Arc::clone(&dispatcher));
    if let Some(quota) = quota {
        pipeline = pipeline.with_quota(quota);
    }
    let pipeline = Arc::new(pipeline);

    let cancel = CancellationToken::new();
    let sweeper = pipeline.spawn_sweeper(
        Duration::from_secs(config.correlation.sweep_interval_secs),
        cancel.clone(),
    );

    let proxy = ProxyInstance::from_config(&config, Arc::clone(&pipeline))?;
    proxy.start().await?;
    tracing::info!(
        data_dir = %config.resolved_data_dir().display(),
        "采集服务已启动"
    );

    tokio::signal::ctrl_c().await.context("等待退出信号失败")?;
    tracing::info!("收到退出信号，正在关闭");

    proxy.stop().await?;
    cancel.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = ?e, "清理任务异常退出");
    }
    dispatcher.shutdown().await;

    let stats = pipeline.stats();
    tracing::info!(
        correlation = ?stats.correlation,
        dispatch = ?stats.dispatch,
        "采集服务已停止"
    );
    Ok(())
}
