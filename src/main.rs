//! stream2sse 服务
//!
//! 把上游分区流中的 JSON 事件以 Server-Sent Events 的形式暴露出来：
//! 每个路由一份有界日志，客户端通过 `?since=` 回放历史后继续实时尾随。
//!
//! 运行: cargo run --bin stream2sse-server -- --routes '[{"path":"/events","start":"TRIM_HORIZON"}]' < events.jsonl

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use stream2sse::service::{Service, ServiceOptions, ServiceState};
use stream2sse::utils::config::{parse_routes_json, ServiceConfig};

/// 命令行参数
#[derive(Debug, Parser)]
#[command(name = "stream2sse-server", version, about)]
struct Args {
    /// TOML 配置文件
    #[arg(short, long, env = "STREAM2SSE_CONFIG")]
    config: Option<PathBuf>,

    /// 监听地址
    #[arg(long, env = "STREAM2SSE_HOST")]
    host: Option<String>,

    /// 监听端口（0 表示任意空闲端口）
    #[arg(short, long, env = "STREAM2SSE_PORT")]
    port: Option<u16>,

    /// JSON 路由数组，追加到配置文件中的路由之后
    #[arg(long, env = "STREAM2SSE_ROUTES")]
    routes: Option<String>,

    /// worker ID 前缀
    #[arg(long, env = "STREAM2SSE_APP_NAME_PREFIX")]
    app_name_prefix: Option<String>,

    /// HTTP worker 数
    #[arg(long)]
    http_workers: Option<usize>,

    /// 输出 debug 日志
    #[arg(long)]
    debug: bool,
}

impl Args {
    /// 合并配置文件与命令行参数
    fn into_config(self) -> anyhow::Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::load_from_file(path)?,
            None => ServiceConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(prefix) = self.app_name_prefix {
            config.app_name_prefix = prefix;
        }
        if let Some(workers) = self.http_workers {
            config.http_workers = workers;
        }
        if let Some(routes) = self.routes {
            config.routes.extend(parse_routes_json(&routes)?);
        }

        config.validate()?;
        Ok(config)
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 初始化日志
    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    // 1. 加载配置
    let config = args.into_config().context("invalid configuration")?;
    let worker_id = config.worker_id();

    log::info!("Configuration loaded");
    log::info!("  Worker id: {}", worker_id);
    for route in &config.routes {
        log::info!(
            "  Route {} (capacity {}, start {}, source {:?})",
            route.path,
            route.effective_capacity(),
            route.start,
            route.source
        );
    }

    // 2. 构建服务
    let service = Arc::new(Service::new(ServiceOptions::from_config(&config, &worker_id))?);

    // 3. 信号处理
    let stopper = {
        let service = Arc::clone(&service);
        actix_web::rt::spawn(async move {
            shutdown_signal().await;
            log::info!("Shutdown signal received");
            if let Err(e) = service.stop().await {
                log::error!("Failed to stop service: {}", e);
            }
        })
    };

    {
        let service = Arc::clone(&service);
        actix_web::rt::spawn(async move {
            if let Ok(addr) = service.addr().await {
                log::info!("🟢 Listening on http://{}", addr);
            }
        });
    }

    // 4. 运行直到停止
    service.start().await.context("service failed")?;

    // HTTP 服务器先于 worker 完成关闭
    if service.state() == ServiceState::Stopping {
        let _ = stopper.await;
    }
    Ok(())
}
