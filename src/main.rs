//! mcrunnerd - 游戏服务器监管守护进程
//!
//! 在 PTY 上启动命令行给定的服务器进程，通过 TCP 提供 JSON-RPC
//! 控制与控制台广播。
//!
//! 环境变量：
//! - MCRUNNER_LISTEN: RPC 监听地址（默认 127.0.0.1:7420）
//! - MCRUNNER_DIR: 服务器工作目录（默认当前目录）
//! - MCRUNNER_ECHO: 是否把服务器输出回显到 stdout（默认开启，0/false 关闭）

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcrunner::hub::{ConsoleHub, HubConfig};
use mcrunner::metrics::ResourceMonitor;
use mcrunner::proc::{LaunchConfig, ReplayBuffer, ServerSupervisor};
use mcrunner::rpc::types::{ServerStatus, TermSize};
use mcrunner::rpc::{RpcMethods, RpcServer};

/// 资源采样间隔
const METRICS_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志输出到 stderr，stdout 留给服务器控制台回显
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let command = args.next().context("用法: mcrunnerd <命令> [参数...]")?;
    let server_args: Vec<String> = args.collect();

    let listen_addr =
        std::env::var("MCRUNNER_LISTEN").unwrap_or_else(|_| "127.0.0.1:7420".to_string());
    let working_dir = std::env::var("MCRUNNER_DIR").ok().map(PathBuf::from);
    let echo = std::env::var("MCRUNNER_ECHO")
        .map(|v| v != "0" && v != "false")
        .unwrap_or(true);

    let run_dir = match &working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("获取当前目录失败")?,
    };

    let replay = Arc::new(ReplayBuffer::default());
    let launch = LaunchConfig {
        command,
        args: server_args,
        working_dir,
        initial_size: TermSize::default(),
        echo,
    };
    let (supervisor, output_rx) = ServerSupervisor::new(launch, replay.clone());
    let supervisor = Arc::new(supervisor);

    let monitor = Arc::new(ResourceMonitor::new(run_dir));
    monitor.clone().spawn(METRICS_INTERVAL);

    let hub = Arc::new(ConsoleHub::new(
        supervisor.clone(),
        replay,
        monitor,
        HubConfig::default(),
    ));
    hub.clone().start(output_rx);

    supervisor.start().context("启动服务器进程失败")?;

    let server = Arc::new(RpcServer::new(
        RpcMethods::new(supervisor.clone(), hub.clone()),
        hub.clone(),
    ));

    tokio::select! {
        result = server.run(&listen_addr) => {
            result.context("RPC 服务异常退出")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("收到退出信号，正在关闭");
        }
    }

    // 先断开订阅者，再停服务器进程
    hub.shutdown();
    if supervisor.status() != ServerStatus::Stopped {
        if let Err(e) = supervisor.stop().await {
            tracing::warn!("优雅停止失败，强制终止: {}", e);
            let _ = supervisor.kill();
            let _ = supervisor.wait().await;
        }
    }
    tracing::info!("已退出");
    Ok(())
}
