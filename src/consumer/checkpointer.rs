//! 检查点 / 租约接口

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::partition::{PartitionStatus, SHARD_END};
use crate::storage::checkpoint::CheckpointRecord;

/// 检查点错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckpointError {
    /// 分区没有任何检查点记录
    #[error("Checkpoint not found for partition {0}")]
    NotFound(String),

    /// 未结束的分区没有租约持有者
    #[error("Partition {0} is not assigned to any worker")]
    NotAssigned(String),

    #[error("Checkpoint backend error: {0}")]
    Backend(String),
}

/// 检查点存储
///
/// 消费子系统通过它管理租约和进度。内存实现见
/// [`InMemoryCheckpointer`](crate::storage::checkpoint::InMemoryCheckpointer)。
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// worker 启动时调用一次
    async fn init(&self) -> Result<(), CheckpointError> {
        Ok(())
    }

    /// 把分区租约授予 `owner`
    async fn acquire_lease(
        &self,
        partition: &PartitionStatus,
        owner: &str,
    ) -> Result<(), CheckpointError>;

    /// 保存分区当前检查点（连同父分区 ID 和租约信息）
    async fn save_progress(&self, partition: &PartitionStatus) -> Result<(), CheckpointError>;

    /// 读取分区检查点并回填到 `partition`
    async fn fetch_progress(
        &self,
        partition: &PartitionStatus,
    ) -> Result<CheckpointRecord, CheckpointError>;

    async fn remove_lease(&self, partition_id: &str) -> Result<(), CheckpointError>;

    async fn remove_owner(&self, partition_id: &str) -> Result<(), CheckpointError>;

    /// 查询租约持有者
    async fn lease_owner(&self, partition_id: &str) -> Result<String, CheckpointError>;

    /// 按持有者分组列出未结束的分区
    async fn list_active_owners(
        &self,
        partitions: &[Arc<PartitionStatus>],
    ) -> Result<HashMap<String, Vec<Arc<PartitionStatus>>>, CheckpointError>;

    /// 接管分区：保留已有进度并重新保存
    async fn claim_partition(
        &self,
        partition: &PartitionStatus,
        claimant: &str,
    ) -> Result<(), CheckpointError>;
}

/// 交给 processor 的检查点句柄，绑定到单个分区
#[derive(Clone)]
pub struct RecordCheckpointer {
    partition: Arc<PartitionStatus>,
    checkpointer: Arc<dyn Checkpointer>,
}

impl RecordCheckpointer {
    pub fn new(partition: Arc<PartitionStatus>, checkpointer: Arc<dyn Checkpointer>) -> Self {
        Self {
            partition,
            checkpointer,
        }
    }

    pub fn partition_id(&self) -> &str {
        self.partition.id()
    }

    /// 提交检查点；`None` 表示分区已读完，写入终止标记
    pub async fn checkpoint(&self, position: Option<&str>) -> Result<(), CheckpointError> {
        let marker = position.unwrap_or(SHARD_END).to_string();
        self.partition.set_checkpoint(Some(marker));
        self.checkpointer.save_progress(&self.partition).await
    }
}
