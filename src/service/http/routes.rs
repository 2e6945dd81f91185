//! HTTP 路由配置

use std::sync::Arc;

use actix_web::web;

use super::handlers;
use crate::service::route::Route;

/// 配置所有路由
pub fn configure(cfg: &mut web::ServiceConfig, routes: &[Arc<Route>]) {
    cfg
        // 健康检查
        .route("/health", web::get().to(handlers::health_check))
        // Prometheus 指标
        .route("/metrics", web::get().to(handlers::metrics));

    // 每个路由一个 SSE 端点
    for route in routes {
        cfg.service(
            web::resource(route.pattern())
                .app_data(web::Data::new(Arc::clone(route)))
                .route(web::get().to(handlers::stream_events)),
        );
    }
}
