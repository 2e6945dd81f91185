//! # STREAM2SSE-RS
//!
//! 有界、按时间索引、多路由的尾随日志服务：把上游分区流中的 JSON 事件
//! 写入每个路由的内存日志，并通过 Server-Sent Events 推送给 HTTP 客户端。
//!
//! ## 核心能力
//!
//! - **时间戳索引**: 固定容量，淘汰最旧条目，按时间查找最接近的偏移量
//! - **检查点存储**: 内存中的租约/进度存储，满足分区 worker 的检查点契约
//! - **摄入管道**: 解码信封、跳过格式错误的记录、按批次提交检查点
//! - **路由编排**: worker + 日志 + 索引 + HTTP 路径，全有或全无地启动/停止
//! - **SSE 推送**: `?since=` 解析为偏移量，然后实时尾随日志
//!
//! ## 架构设计
//!
//! ```text
//! RecordSource (lines / memory)
//!     ↓
//! PartitionWorker (consumer/) ← Checkpointer (storage/checkpoint/)
//!     ↓
//! RouteRecordProcessor (ingest/)
//!     ↓
//! MemLog + TimestampIndex (storage/)
//!     ↓
//! Service / Route (service/) → GET <path>?since=... (text/event-stream)
//! ```

// ============================================================================
// 内部模块
// ============================================================================

/// 上游分区流的能力接口与单进程 worker
pub mod consumer;

/// 摄入管道
pub mod ingest;

/// 可观测性模块 (Prometheus)
pub mod observability;

/// 服务层 (路由 + HTTP/SSE)
pub mod service;

/// 内存日志、时间戳索引、检查点存储
pub mod storage;

/// 工具模块
pub mod utils;

// ============================================================================
// 重导出常用类型
// ============================================================================

pub use consumer::{
    Checkpointer, InitialPosition, LinesSource, MemorySource, PartitionWorkerBuilder,
    RecordSource, Worker, WorkerBuilder, WorkerConfig,
};
pub use service::{Route, RouteOptions, Service, ServiceOptions, ServiceState};
pub use storage::checkpoint::InMemoryCheckpointer;
pub use storage::index::{SharedTimestampIndex, TimestampIndex};
pub use storage::{MemLog, Offset};
pub use utils::config::{RouteConfig, ServiceConfig, SourceConfig, StartPosition};

// ============================================================================
// 全局错误类型
// ============================================================================

/// 顶层错误类型
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Service error: {0}")]
    Service(#[from] service::ServiceError),

    #[error("Configuration error: {0}")]
    Config(#[from] utils::config::ConfigError),

    #[error("Index error: {0}")]
    Index(#[from] storage::index::IndexError),

    #[error("Log error: {0}")]
    Log(#[from] storage::LogError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] consumer::CheckpointError),

    #[error("Worker error: {0}")]
    Worker(#[from] consumer::WorkerError),

    #[error("Invalid time: {0}")]
    Duration(#[from] utils::duration::DurationError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
