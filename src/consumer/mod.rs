//! 流消费子系统
//!
//! 定义上游分区流与本服务之间的能力接口：
//!
//! ```text
//! RecordSource ──► PartitionWorker ──► RecordProcessor (每分区一个)
//!                        │                    │
//!                        └──── Checkpointer ◄─┘ (RecordCheckpointer)
//! ```
//!
//! `ingest` 模块实现 `RecordProcessor`；`PartitionWorker` 是一个
//! 单进程的 `Worker` 实现，任何满足 `Worker` 契约的实现都可以替换它。

pub mod checkpointer;
pub mod lines;
pub mod partition;
pub mod source;
pub mod worker;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

pub use checkpointer::{CheckpointError, Checkpointer, RecordCheckpointer};
pub use lines::LinesSource;
pub use partition::{PartitionStatus, SHARD_END};
pub use source::{MemorySource, PartitionInfo, ReadBatch, RecordSource, SourceError, StartingPoint};
pub use worker::{PartitionWorker, PartitionWorkerBuilder, WorkerConfig};

/// 上游记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// 分区内单调递增的序列号
    pub sequence_number: String,
    pub partition_key: String,
    pub data: Bytes,
    /// 记录到达上游的大致时间
    pub approximate_arrival: DateTime<Utc>,
}

/// 分区处理开始时交给 processor 的信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializationInput {
    pub partition_id: String,
    /// 恢复时的起始检查点
    pub checkpoint: Option<String>,
}

/// 一批记录
pub struct ProcessRecordsInput {
    pub records: Vec<Record>,
    /// 落后最新记录的毫秒数
    pub millis_behind_latest: i64,
    pub cache_entry_time: Option<Instant>,
    pub cache_exit_time: Option<Instant>,
    pub checkpointer: Option<RecordCheckpointer>,
}

/// 分区处理结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// worker 被要求停止
    Requested,
    /// 分区已读完（分裂/合并或源关闭）
    Terminate,
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownReason::Requested => "REQUESTED",
            ShutdownReason::Terminate => "TERMINATE",
        }
    }
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ShutdownInput {
    pub reason: ShutdownReason,
    pub checkpointer: RecordCheckpointer,
}

/// 单分区记录处理器
#[async_trait]
pub trait RecordProcessor: Send {
    async fn initialize(&mut self, input: InitializationInput);

    async fn process_records(&mut self, input: ProcessRecordsInput);

    async fn shutdown(&mut self, input: ShutdownInput);
}

/// 为每个分区创建处理器
pub trait RecordProcessorFactory: Send + Sync {
    fn create_processor(&self) -> Box<dyn RecordProcessor>;
}

/// worker 错误
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Worker already started")]
    AlreadyStarted,
}

/// 一个路由的消费 worker
#[async_trait]
pub trait Worker: Send + Sync {
    /// 开始消费；返回后后台任务持续运行直到 `shutdown`
    async fn start(&self) -> Result<(), WorkerError>;

    /// 停止消费并等待所有分区处理器的 shutdown 回调完成
    async fn shutdown(&self);
}

/// 延迟构造 worker：路由创建 processor factory 之后才调用
pub trait WorkerBuilder: Send {
    fn build(
        self: Box<Self>,
        factory: Arc<dyn RecordProcessorFactory>,
        ct: CancellationToken,
    ) -> Arc<dyn Worker>;
}

/// 没有检查点的分区从哪里开始读
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialPosition {
    /// 只读之后写入的记录
    #[default]
    Latest,
    /// 从保留的最旧记录开始
    Earliest,
    /// 从到达时间不早于给定时间的第一条记录开始
    AtTimestamp(DateTime<Utc>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_reason_display() {
        assert_eq!(ShutdownReason::Requested.to_string(), "REQUESTED");
        assert_eq!(ShutdownReason::Terminate.to_string(), "TERMINATE");
    }

    #[test]
    fn test_initial_position_defaults_to_latest() {
        assert_eq!(InitialPosition::default(), InitialPosition::Latest);
    }
}
