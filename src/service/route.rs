//! 路由：一个 HTTP 路径 + 一份有界日志 + 一个时间戳索引 + 可选的摄入 worker

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::ServiceError;
use crate::consumer::{Worker, WorkerBuilder};
use crate::ingest::RouteProcessorFactory;
use crate::observability::{LOG_LATEST_OFFSET, RECORDS_INGESTED};
use crate::storage::index::SharedTimestampIndex;
use crate::storage::{LogError, MemLog, Offset};
pub use crate::utils::config::DEFAULT_CAPACITY;

/// 保留给服务自身的路径
pub const RESERVED_PATTERNS: [&str; 2] = ["/health", "/metrics"];

/// 路由参数
pub struct RouteOptions {
    /// HTTP 路径，例如 `/events`
    pub pattern: String,

    /// 保留的事件数；0 表示 [`DEFAULT_CAPACITY`]
    pub capacity: usize,

    /// 摄入 worker；为 `None` 时由调用方通过 [`Route::append`] 写入
    pub worker: Option<Box<dyn WorkerBuilder>>,
}

impl RouteOptions {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            capacity: 0,
            worker: None,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_worker(mut self, worker: Box<dyn WorkerBuilder>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ServiceError> {
        if self.pattern.is_empty() {
            return Err(ServiceError::Validation(
                "route pattern cannot be empty".to_string(),
            ));
        }
        if !self.pattern.starts_with('/') {
            return Err(ServiceError::Validation(format!(
                "route pattern must start with '/': {}",
                self.pattern
            )));
        }
        if RESERVED_PATTERNS.contains(&self.pattern.as_str()) {
            return Err(ServiceError::Validation(format!(
                "route pattern is reserved: {}",
                self.pattern
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for RouteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteOptions")
            .field("pattern", &self.pattern)
            .field("capacity", &self.capacity)
            .field("worker", &self.worker.is_some())
            .finish()
    }
}

/// 已构建的路由
pub struct Route {
    pattern: String,
    capacity: usize,
    log: Arc<MemLog>,
    index: Arc<SharedTimestampIndex>,
    worker: Option<Arc<dyn Worker>>,
}

impl Route {
    /// 日志随 `ct` 关闭；worker 使用 `ct` 的子 token
    pub(crate) fn new(options: RouteOptions, ct: &CancellationToken) -> Result<Self, ServiceError> {
        options.validate()?;

        let capacity = if options.capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            options.capacity
        };

        let log = Arc::new(
            MemLog::new(capacity, ct.clone())
                .map_err(|e| ServiceError::Validation(e.to_string()))?,
        );
        let index = Arc::new(
            SharedTimestampIndex::new(capacity)
                .map_err(|e| ServiceError::Validation(e.to_string()))?,
        );

        let worker = options.worker.map(|builder| {
            let factory = Arc::new(RouteProcessorFactory::new(
                &options.pattern,
                Arc::clone(&log),
                Arc::clone(&index),
            ));
            builder.build(factory, ct.child_token())
        });

        Ok(Self {
            pattern: options.pattern,
            capacity,
            log,
            index,
            worker,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn log(&self) -> &Arc<MemLog> {
        &self.log
    }

    pub fn index(&self) -> &Arc<SharedTimestampIndex> {
        &self.index
    }

    pub fn worker(&self) -> Option<&Arc<dyn Worker>> {
        self.worker.as_ref()
    }

    /// 直接写入一条事件（日志 + 索引），与摄入管道持有同一把索引写锁
    pub fn append(
        &self,
        payload: impl Into<bytes::Bytes>,
        timestamp: DateTime<Utc>,
    ) -> Result<Offset, LogError> {
        let mut index = self.index.write();
        let offset = self.log.write(payload)?;

        if let Err(e) = index.add(offset, timestamp) {
            log::error!(
                "[route {}] timestamp index rejected offset {}: {}. Exiting!",
                self.pattern,
                offset,
                e
            );
            panic!("timestamp index out of sync with log: {}", e);
        }
        drop(index);

        RECORDS_INGESTED.with_label_values(&[self.pattern.as_str()]).inc();
        LOG_LATEST_OFFSET
            .with_label_values(&[self.pattern.as_str()])
            .set(offset);

        Ok(offset)
    }

    /// 解析流的起始偏移量
    ///
    /// 没有 `since` 时从下一次写入开始；有 `since` 时取索引中最接近的偏移量，
    /// 索引为空则同样从下一次写入开始。
    pub fn start_offset(&self, since: Option<DateTime<Utc>>) -> Offset {
        let next = self.log.next_offset().max(0);
        match since {
            Some(ts) => self.index.nearest_offset(ts).unwrap_or(next),
            None => next,
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern)
            .field("capacity", &self.capacity)
            .field("worker", &self.worker.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ms(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn test_options_validation() {
        assert!(RouteOptions::new("/events").validate().is_ok());
        assert!(matches!(
            RouteOptions::new("").validate(),
            Err(ServiceError::Validation(_))
        ));
        assert!(RouteOptions::new("events").validate().is_err());
        assert!(RouteOptions::new("/health").validate().is_err());
        assert!(RouteOptions::new("/metrics").validate().is_err());
    }

    #[test]
    fn test_zero_capacity_uses_default() {
        let ct = CancellationToken::new();
        let route = Route::new(RouteOptions::new("/events"), &ct).unwrap();
        assert_eq!(route.capacity(), DEFAULT_CAPACITY);
        assert_eq!(route.index().capacity(), DEFAULT_CAPACITY);
        assert!(route.worker().is_none());

        let route = Route::new(RouteOptions::new("/small").with_capacity(3), &ct).unwrap();
        assert_eq!(route.log().capacity(), 3);
    }

    #[test]
    fn test_append_and_start_offset() {
        let ct = CancellationToken::new();
        let route = Route::new(RouteOptions::new("/events").with_capacity(2), &ct).unwrap();

        assert_eq!(route.start_offset(None), 0);
        assert_eq!(route.start_offset(Some(ms(0))), 0);

        assert_eq!(route.append("{\"a\":1}", ms(100)).unwrap(), 0);
        assert_eq!(route.append("{\"a\":2}", ms(500)).unwrap(), 1);

        assert_eq!(route.start_offset(None), 2);
        assert_eq!(route.start_offset(Some(ms(0))), 0);
        assert_eq!(route.start_offset(Some(ms(250))), 1);
        assert_eq!(route.start_offset(Some(ms(600))), 1);

        // 淘汰 0
        assert_eq!(route.append("{\"a\":3}", ms(250)).unwrap(), 2);
        assert_eq!(route.start_offset(Some(ms(0))), 2);
        assert_eq!(route.start_offset(Some(ms(300))), 1);
        assert_eq!(route.log().range(), (1, 2));

        ct.cancel();
        assert_eq!(route.append("x", ms(0)), Err(LogError::Closed));
    }
}
