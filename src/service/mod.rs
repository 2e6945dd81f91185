//! 服务编排
//!
//! [`Service`] 持有全部路由和 HTTP 监听器，负责整体的启动与停止：
//!
//! ```text
//! Created ──start()──▶ Starting ──▶ Running ──stop()──▶ Stopping ──▶ Stopped
//!                         │                                 ▲
//!                         └──────────── stop() ─────────────┘
//! ```
//!
//! - 启动是全有或全无的：任何一个路由的 worker 启动失败、或监听器绑定失败，
//!   已启动的 worker 全部被关闭后才返回错误
//! - 监听地址通过 [`Service::addr`] 等待，绑定成功后恰好发布一次
//! - 第二次 `start()` / `stop()` 返回 [`ServiceError::InvalidState`]

pub mod http;
pub mod route;

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actix_web::dev::{Server, ServerHandle};
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::consumer::{
    LinesSource, PartitionWorkerBuilder, RecordSource, WorkerConfig, WorkerError,
};
use crate::observability::init_metrics;
use crate::utils::config::{ServiceConfig, SourceConfig, DEFAULT_PORT};
pub use route::{Route, RouteOptions, DEFAULT_CAPACITY, RESERVED_PATTERNS};

/// 服务错误
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid service state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: ServiceState,
    },

    #[error("Route {route} failed to start its worker: {source}")]
    WorkerStart {
        route: String,
        #[source]
        source: WorkerError,
    },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Service is not listening")]
    NotListening,

    #[error("HTTP server did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// 服务生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Created = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServiceState::Created,
            1 => ServiceState::Starting,
            2 => ServiceState::Running,
            3 => ServiceState::Stopping,
            _ => ServiceState::Stopped,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Created => "Created",
            ServiceState::Starting => "Starting",
            ServiceState::Running => "Running",
            ServiceState::Stopping => "Stopping",
            ServiceState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

/// 服务参数
#[derive(Debug)]
pub struct ServiceOptions {
    pub host: String,

    /// 0 表示由系统分配空闲端口
    pub port: u16,

    pub http_workers: usize,

    pub shutdown_timeout: Duration,

    pub routes: Vec<RouteOptions>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            http_workers: 2,
            shutdown_timeout: Duration::from_secs(5),
            routes: Vec::new(),
        }
    }
}

impl ServiceOptions {
    /// 从配置文件构建服务参数
    ///
    /// `lines` 类型的路由得到一个基于 [`LinesSource`] 的分区 worker；
    /// `memory` 类型的路由没有 worker，由嵌入方调用 [`Route::append`]。
    pub fn from_config(config: &ServiceConfig, worker_id: &str) -> Self {
        let now = Utc::now();

        let routes = config
            .routes
            .iter()
            .map(|rc| {
                let options = RouteOptions::new(rc.path.clone()).with_capacity(rc.capacity);
                match &rc.source {
                    SourceConfig::Lines { path, follow } => {
                        let source: Arc<dyn RecordSource> =
                            Arc::new(LinesSource::new(path.clone(), *follow));
                        let worker_config = WorkerConfig {
                            worker_id: worker_id.to_string(),
                            initial_position: rc.start.resolve(now),
                            poll_interval: Duration::from_millis(rc.poll_interval_ms),
                            partition_sync_interval: Duration::from_millis(
                                rc.partition_sync_interval_ms,
                            ),
                            max_records: rc.max_records,
                        };
                        options.with_worker(Box::new(PartitionWorkerBuilder::new(
                            source,
                            worker_config,
                        )))
                    }
                    SourceConfig::Memory => options,
                }
            })
            .collect();

        Self {
            host: config.host.clone(),
            port: config.port,
            http_workers: config.http_workers,
            shutdown_timeout: config.shutdown_timeout(),
            routes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Pending,
    Bound(SocketAddr),
    Closed,
}

/// 多路由 SSE 服务
pub struct Service {
    routes: Vec<Arc<Route>>,

    /// 日志与 worker 的根取消信号
    ct: CancellationToken,

    state: AtomicU8,

    /// 监听地址，只从 Pending 转换一次
    listener: watch::Sender<ListenerState>,

    server: Mutex<Option<ServerHandle>>,

    /// 串行化启动和停止的关键区段
    lifecycle: tokio::sync::Mutex<()>,

    host: String,
    port: u16,
    http_workers: usize,
    shutdown_timeout: Duration,
}

impl Service {
    /// 创建服务并构建全部路由
    pub fn new(options: ServiceOptions) -> Result<Self, ServiceError> {
        init_metrics();

        let ct = CancellationToken::new();
        let mut routes: Vec<Arc<Route>> = Vec::with_capacity(options.routes.len());

        for route_options in options.routes {
            if routes.iter().any(|r| r.pattern() == route_options.pattern) {
                return Err(ServiceError::Validation(format!(
                    "duplicate route pattern: {}",
                    route_options.pattern
                )));
            }
            let route = Route::new(route_options, &ct)?;
            log::debug!(
                "Route {} created (capacity {}, worker: {})",
                route.pattern(),
                route.capacity(),
                route.worker().is_some()
            );
            routes.push(Arc::new(route));
        }

        Ok(Self {
            routes,
            ct,
            state: AtomicU8::new(ServiceState::Created as u8),
            listener: watch::Sender::new(ListenerState::Pending),
            server: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            host: options.host,
            port: options.port,
            http_workers: options.http_workers,
            shutdown_timeout: options.shutdown_timeout,
        })
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn route(&self, pattern: &str) -> Option<&Arc<Route>> {
        self.routes.iter().find(|r| r.pattern() == pattern)
    }

    fn transition(&self, from: ServiceState, to: ServiceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// 启动全部 worker，绑定监听器并开始服务
    ///
    /// 一直运行到服务被停止；由 [`Service::stop`] 触发的关闭不视为错误。
    pub async fn start(&self) -> Result<(), ServiceError> {
        if !self.transition(ServiceState::Created, ServiceState::Starting) {
            return Err(ServiceError::InvalidState {
                expected: "Created",
                actual: self.state(),
            });
        }

        let server = {
            let _guard = self.lifecycle.lock().await;

            if self.state() != ServiceState::Starting {
                log::info!("Service stopped before it finished starting");
                return Ok(());
            }

            let mut started = Vec::with_capacity(self.routes.len());
            for route in &self.routes {
                let Some(worker) = route.worker() else {
                    continue;
                };
                if let Err(e) = worker.start().await {
                    log::error!("Route {} failed to start: {}", route.pattern(), e);
                    self.abort_start(&started).await;
                    return Err(ServiceError::WorkerStart {
                        route: route.pattern().to_string(),
                        source: e,
                    });
                }
                log::info!("Route {} worker started", route.pattern());
                started.push(Arc::clone(route));
            }

            let (server, local_addr) = match self.bind_http() {
                Ok(bound) => bound,
                Err(e) => {
                    log::error!("{}", e);
                    self.abort_start(&started).await;
                    return Err(e);
                }
            };
            *self.server.lock() = Some(server.handle());

            if self.transition(ServiceState::Starting, ServiceState::Running) {
                log::info!("Service listening on {}", local_addr);
            }
            self.listener.send_if_modified(|state| {
                if *state == ListenerState::Pending {
                    *state = ListenerState::Bound(local_addr);
                    true
                } else {
                    false
                }
            });

            server
        };

        server.await?;
        log::info!("HTTP server closed");
        Ok(())
    }

    fn bind_http(&self) -> Result<(Server, SocketAddr), ServiceError> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr).map_err(|source| ServiceError::Bind {
            addr: addr.clone(),
            source,
        })?;
        let local_addr = listener.local_addr()?;

        let server = http::HttpServer::new(
            self.routes.clone(),
            self.ct.clone(),
            self.http_workers,
            self.shutdown_timeout,
        )
        .listen(listener)?;

        Ok((server, local_addr))
    }

    /// 启动失败时回滚已启动的 worker
    async fn abort_start(&self, started: &[Arc<Route>]) {
        self.ct.cancel();
        join_all(
            started
                .iter()
                .filter_map(|route| route.worker())
                .map(|worker| worker.shutdown()),
        )
        .await;
        self.close_listener();
        self.state
            .store(ServiceState::Stopped as u8, Ordering::SeqCst);
    }

    fn close_listener(&self) {
        self.listener.send_if_modified(|state| {
            if *state == ListenerState::Pending {
                *state = ListenerState::Closed;
                true
            } else {
                false
            }
        });
    }

    /// 等待监听器绑定并返回地址
    ///
    /// 启动失败或服务在绑定前被停止时返回 [`ServiceError::NotListening`]。
    pub async fn addr(&self) -> Result<SocketAddr, ServiceError> {
        let mut rx = self.listener.subscribe();
        let state = *rx
            .wait_for(|state| *state != ListenerState::Pending)
            .await
            .map_err(|_| ServiceError::NotListening)?;

        match state {
            ListenerState::Bound(addr) => Ok(addr),
            _ => Err(ServiceError::NotListening),
        }
    }

    /// 停止服务
    ///
    /// 取消所有 worker 和日志，并发关闭全部 worker 和 HTTP 服务器，
    /// 两者都完成后返回。worker 的关闭是尽力而为的；HTTP 关闭的错误会被返回。
    pub async fn stop(&self) -> Result<(), ServiceError> {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                match ServiceState::from_u8(state) {
                    ServiceState::Starting | ServiceState::Running => {
                        Some(ServiceState::Stopping as u8)
                    }
                    _ => None,
                }
            })
            .map_err(|actual| ServiceError::InvalidState {
                expected: "Starting or Running",
                actual: ServiceState::from_u8(actual),
            })?;

        log::info!("Stopping service ({} routes)", self.routes.len());
        self.ct.cancel();

        let _guard = self.lifecycle.lock().await;

        let workers = join_all(
            self.routes
                .iter()
                .filter_map(|route| route.worker())
                .map(|worker| worker.shutdown()),
        );
        let (_, result) = tokio::join!(workers, self.stop_http());

        self.close_listener();
        self.state
            .store(ServiceState::Stopped as u8, Ordering::SeqCst);
        log::info!("Service stopped");

        result
    }

    async fn stop_http(&self) -> Result<(), ServiceError> {
        let handle = self.server.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let limit = self.shutdown_timeout + Duration::from_secs(1);
        tokio::time::timeout(limit, handle.stop(true))
            .await
            .map_err(|_| ServiceError::ShutdownTimeout(limit))
    }
}
