//! HTTP 请求处理器

use std::convert::Infallible;
use std::sync::Arc;

use actix_web::http::{header, Version};
use actix_web::{web, HttpRequest, HttpResponse};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::sse;
use crate::observability::{export_metrics, StreamGauge, EVENTS_SENT};
use crate::service::route::Route;
use crate::storage::LogStream;
use crate::utils::duration::parse_point_in_time;

/// 所有流共享的上下文
#[derive(Clone)]
pub struct StreamContext {
    /// 服务停止时取消，结束所有流
    pub ct: CancellationToken,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub since: Option<String>,
}

/// 健康检查
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().finish()
}

/// Prometheus 指标
pub async fn metrics() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(export_metrics())
}

fn plain_error(mut builder: actix_web::HttpResponseBuilder, message: &'static str) -> HttpResponse {
    builder
        .content_type("text/plain; charset=utf-8")
        .body(format!("{}\n", message))
}

/// 响应能否增量刷新：HTTP/1.0 没有分块传输
fn supports_streaming(req: &HttpRequest) -> bool {
    req.version() >= Version::HTTP_11
}

/// 解析 `since`：RFC3339 或 "now - 时长"；空值视为未提供
fn parse_since(req: &HttpRequest) -> Result<Option<DateTime<Utc>>, String> {
    let query = web::Query::<StreamQuery>::from_query(req.query_string())
        .map_err(|e| e.to_string())?
        .into_inner();

    match query.since {
        None => Ok(None),
        Some(since) if since.is_empty() => Ok(None),
        Some(since) => parse_point_in_time(&since, Utc::now())
            .map(Some)
            .map_err(|e| e.to_string()),
    }
}

struct StreamState {
    cursor: LogStream,
    route: String,
    _gauge: StreamGauge,
}

/// SSE 流
///
/// `GET <pattern>[?since=<RFC3339>|<duration>]`
pub async fn stream_events(
    req: HttpRequest,
    route: web::Data<Arc<Route>>,
    ctx: web::Data<StreamContext>,
) -> HttpResponse {
    if !supports_streaming(&req) {
        log::error!(
            "[route {}] response cannot be flushed incrementally ({:?})",
            route.pattern(),
            req.version()
        );
        return plain_error(HttpResponse::InternalServerError(), "Internal Server Error");
    }

    let since = match parse_since(&req) {
        Ok(since) => since,
        Err(e) => {
            log::warn!("[route {}] bad since parameter: {}", route.pattern(), e);
            return plain_error(HttpResponse::BadRequest(), "Bad Request");
        }
    };

    // 在发送 :ok 之前确定起点，之后写入的事件都不会丢
    let offset = route.start_offset(since);
    log::debug!(
        "[route {}] streaming from offset {} (since {:?})",
        route.pattern(),
        offset,
        since
    );

    let state = StreamState {
        cursor: route.log().stream(ctx.ct.clone(), offset),
        route: route.pattern().to_string(),
        _gauge: StreamGauge::new(route.pattern()),
    };

    let events = stream::unfold(state, |mut state| async move {
        let record = state.cursor.next().await?;
        EVENTS_SENT
            .with_label_values(&[state.route.as_str()])
            .inc();
        Some((Ok::<Bytes, Infallible>(sse::data_frame(&record.data)), state))
    });

    let body = stream::once(async { Ok::<Bytes, Infallible>(sse::ok_frame()) }).chain(events);

    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, sse::CONTENT_TYPE))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(body)
}
