// 集成测试共用工具

#![allow(dead_code)]

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};

use stream2sse::service::{Service, ServiceError, ServiceOptions};

pub const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// 在 port 0 上启动服务，返回服务、地址和运行任务
pub async fn start_service(
    options: ServiceOptions,
) -> (
    Arc<Service>,
    SocketAddr,
    tokio::task::JoinHandle<Result<(), ServiceError>>,
) {
    let service = Arc::new(Service::new(options).expect("service"));
    let runner = {
        let service = Arc::clone(&service);
        actix_web::rt::spawn(async move { service.start().await })
    };
    let addr = service.addr().await.expect("listener address");
    (service, addr, runner)
}

pub fn local_options() -> ServiceOptions {
    ServiceOptions {
        host: "127.0.0.1".to_string(),
        port: 0,
        http_workers: 1,
        shutdown_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

/// 最小的 SSE 客户端：按空行切分帧
pub struct SseClient {
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: String,
}

impl SseClient {
    pub async fn connect(url: &str) -> Self {
        let response = reqwest::get(url).await.expect("request");
        assert_eq!(response.status(), 200);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some("text/event-stream")
        );
        Self {
            body: Box::pin(response.bytes_stream()),
            buffer: String::new(),
        }
    }

    /// 下一帧（不含结尾的空行）；流结束或超时返回 None
    pub async fn next_frame(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.buffer.find("\n\n") {
                let frame = self.buffer[..pos].to_string();
                self.buffer.drain(..pos + 2);
                return Some(frame);
            }

            match tokio::time::timeout(FRAME_TIMEOUT, self.body.next()).await {
                Ok(Some(Ok(chunk))) => self.buffer.push_str(&String::from_utf8_lossy(&chunk)),
                _ => return None,
            }
        }
    }

    /// 跳过 `:ok`，返回下一条事件的数据
    pub async fn next_data(&mut self) -> Option<String> {
        loop {
            let frame = self.next_frame().await?;
            if let Some(data) = frame.strip_prefix("data: ") {
                return Some(data.to_string());
            }
        }
    }
}

/// 轮询直到条件成立
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + FRAME_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
