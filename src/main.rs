use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use capture_rs::capture::{policy, CaptureAddon, CaptureBuffer, CaptureStore};
use capture_rs::ingest;
use capture_rs::model::config::Config;
use capture_rs::status::StatusReport;

/// 中间人代理流量捕获器
#[derive(Parser, Debug)]
#[command(name = "capture-rs", version, about)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 输出目录（覆盖配置文件与 OUTPUT_DIR）
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// 定时保存间隔（秒）
    #[arg(long, global = true)]
    save_interval: Option<u64>,

    /// 触发保存的记录数
    #[arg(long, global = true)]
    save_count: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// 从 stdin 读取代理引擎事件并持续捕获（默认）
    Run,
    /// 输出捕获目录与证书状态
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env 不存在时忽略
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Status => {
            let report = StatusReport::collect(&config);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

/// 配置优先级：命令行 > 环境变量 > 配置文件 > 默认值
fn load_config(args: &Args) -> anyhow::Result<Config> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(Config::default_config_path()));
    let mut config = Config::load(&path)?;
    config.apply_env();

    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(interval) = args.save_interval {
        config.save_interval = interval;
    }
    if let Some(count) = args.save_count {
        config.save_count = count;
    }
    Ok(config.validated())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let store = CaptureStore::open(&config)
        .with_context(|| format!("初始化输出目录失败: {}", config.output_dir.display()))?;
    let buffer = Arc::new(CaptureBuffer::new());
    let (handle, _worker) = policy::spawn_flush_worker(buffer.clone(), Arc::new(store));
    let timer = policy::spawn_timer(handle.clone(), buffer.clone(), config.save_interval());
    let addon = CaptureAddon::new(&config, buffer, handle.clone());

    tracing::info!(
        output_dir = %config.output_dir.display(),
        save_interval = config.save_interval,
        save_count = config.save_count,
        "捕获服务已启动"
    );

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let signals = async {
        match policy::watch_signals(handle, config.shutdown_timeout()).await {
            Ok(name) => name,
            Err(e) => {
                // 信号注册失败不影响捕获，只剩事件流结束这一条退出路径
                tracing::error!("注册信号处理失败: {}", e);
                std::future::pending().await
            }
        }
    };

    tokio::select! {
        summary = ingest::run(stdin, &addon) => {
            tracing::info!(
                requests = summary.requests,
                responses = summary.responses,
                malformed = summary.malformed,
                read_error = summary.read_error.as_deref(),
                total = summary.total_captured,
                "事件流结束"
            );
        }
        name = signals => {
            tracing::info!(
                signal = name,
                total = addon.buffer().total_count(),
                "已完成强制保存，退出"
            );
        }
    }

    timer.abort();
    Ok(())
}
