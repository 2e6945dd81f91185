//! Prometheus 指标导出模块
//!
//! 提供路由级监控指标，包括：
//! - 摄入记录数 / 跳过记录数（按原因）
//! - 批次数与批处理延迟
//! - 活跃 SSE 连接数与已发送事件数
//! - 日志最新偏移量

use lazy_static::lazy_static;
use prometheus::{
    self, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};

lazy_static! {
    /// 全局 Prometheus Registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ═══════════════════════════════════════════════════════════════════
    // 摄入指标
    // ═══════════════════════════════════════════════════════════════════

    /// 写入日志的记录总数
    pub static ref RECORDS_INGESTED: IntCounterVec = IntCounterVec::new(
        Opts::new("records_ingested_total", "Total number of records appended to route logs")
            .namespace("stream2sse"),
        &["route"]
    ).expect("Failed to create RECORDS_INGESTED metric");

    /// 跳过的记录总数
    pub static ref RECORDS_SKIPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("records_skipped_total", "Total number of records skipped during ingestion")
            .namespace("stream2sse"),
        &["route", "reason"]
    ).expect("Failed to create RECORDS_SKIPPED metric");

    /// 处理的批次总数
    pub static ref BATCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("batches_total", "Total number of record batches processed")
            .namespace("stream2sse"),
        &["route"]
    ).expect("Failed to create BATCHES_TOTAL metric");

    /// 批处理延迟 (微秒)
    pub static ref BATCH_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("batch_latency_us", "Batch processing latency in microseconds")
            .namespace("stream2sse")
            .buckets(vec![10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 25000.0, 100000.0]),
        &["route"]
    ).expect("Failed to create BATCH_LATENCY metric");

    /// 日志最新偏移量
    pub static ref LOG_LATEST_OFFSET: IntGaugeVec = IntGaugeVec::new(
        Opts::new("log_latest_offset", "Latest offset written to the route log")
            .namespace("stream2sse"),
        &["route"]
    ).expect("Failed to create LOG_LATEST_OFFSET metric");

    // ═══════════════════════════════════════════════════════════════════
    // 流式输出指标
    // ═══════════════════════════════════════════════════════════════════

    /// 当前 SSE 连接数
    pub static ref ACTIVE_STREAMS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("active_streams", "Current number of connected SSE clients")
            .namespace("stream2sse"),
        &["route"]
    ).expect("Failed to create ACTIVE_STREAMS metric");

    /// 已发送的事件总数
    pub static ref EVENTS_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("events_sent_total", "Total number of SSE events sent to clients")
            .namespace("stream2sse"),
        &["route"]
    ).expect("Failed to create EVENTS_SENT metric");
}

/// 初始化所有指标到 Registry（重复调用无副作用）
pub fn init_metrics() {
    // 摄入指标
    REGISTRY.register(Box::new(RECORDS_INGESTED.clone())).ok();
    REGISTRY.register(Box::new(RECORDS_SKIPPED.clone())).ok();
    REGISTRY.register(Box::new(BATCHES_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(BATCH_LATENCY.clone())).ok();
    REGISTRY.register(Box::new(LOG_LATEST_OFFSET.clone())).ok();

    // 流式输出指标
    REGISTRY.register(Box::new(ACTIVE_STREAMS.clone())).ok();
    REGISTRY.register(Box::new(EVENTS_SENT.clone())).ok();

    log::debug!("Prometheus metrics initialized");
}

/// 导出指标为 Prometheus 格式
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        log::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// 带标签的计时器
pub struct LabeledTimer {
    start: std::time::Instant,
    histogram: HistogramVec,
    labels: Vec<String>,
}

impl LabeledTimer {
    pub fn new(histogram: HistogramVec, labels: Vec<String>) -> Self {
        Self {
            start: std::time::Instant::now(),
            histogram,
            labels,
        }
    }

    pub fn observe(self) {
        let elapsed = self.start.elapsed().as_micros() as f64;
        let label_refs: Vec<&str> = self.labels.iter().map(|s| s.as_str()).collect();
        self.histogram.with_label_values(&label_refs).observe(elapsed);
    }
}

/// SSE 连接计数守卫：创建时 +1，析构时 -1
pub struct StreamGauge {
    route: String,
}

impl StreamGauge {
    pub fn new(route: &str) -> Self {
        ACTIVE_STREAMS.with_label_values(&[route]).inc();
        Self {
            route: route.to_string(),
        }
    }
}

impl Drop for StreamGauge {
    fn drop(&mut self) {
        ACTIVE_STREAMS.with_label_values(&[&self.route]).dec();
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 便捷宏
// ═══════════════════════════════════════════════════════════════════════

/// 记录被跳过的输入
#[macro_export]
macro_rules! record_skipped {
    ($route:expr, $reason:expr) => {
        $crate::observability::RECORDS_SKIPPED
            .with_label_values(&[$route, $reason])
            .inc();
    };
}
