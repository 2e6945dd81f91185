//! HTTP 服务模块
//!
//! 提供 SSE 流式端点、健康检查和 Prometheus 指标

pub mod handlers;
pub mod routes;
pub mod sse;

use actix_web::dev::Server;
use actix_web::{middleware, web, App, HttpServer as ActixHttpServer};
use std::io;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::route::Route;
use handlers::StreamContext;

/// HTTP 服务器
pub struct HttpServer {
    /// 已构建的路由
    routes: Vec<Arc<Route>>,

    /// 服务停止时取消，结束所有 SSE 流
    ct: CancellationToken,

    /// actix worker 数
    http_workers: usize,

    /// 优雅关闭超时
    shutdown_timeout: Duration,
}

impl HttpServer {
    pub fn new(
        routes: Vec<Arc<Route>>,
        ct: CancellationToken,
        http_workers: usize,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            routes,
            ct,
            http_workers: http_workers.max(1),
            shutdown_timeout,
        }
    }

    /// 在已绑定的监听器上构建服务器
    ///
    /// 返回的 [`Server`] 需要被 await 才会开始处理请求；信号由调用方处理。
    pub fn listen(self, listener: TcpListener) -> io::Result<Server> {
        let addr = listener.local_addr()?;
        log::info!(
            "Starting HTTP server at {} ({} routes)",
            addr,
            self.routes.len()
        );

        let shared_routes = self.routes;
        let context = StreamContext { ct: self.ct };

        let server = ActixHttpServer::new(move || {
            let app_routes = shared_routes.clone();
            App::new()
                .app_data(web::Data::new(context.clone()))
                // 中间件
                .wrap(middleware::Logger::default())
                // CORS 支持
                .wrap(
                    actix_cors::Cors::default()
                        .allow_any_origin()
                        .allow_any_method()
                        .allow_any_header()
                        .max_age(3600),
                )
                // 配置路由
                .configure(move |cfg| routes::configure(cfg, &app_routes))
        })
        .workers(self.http_workers)
        .disable_signals()
        .shutdown_timeout(self.shutdown_timeout.as_secs())
        .listen(listener)?
        .run();

        Ok(server)
    }
}
