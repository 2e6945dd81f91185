//! 分区状态

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// 分区读完后写入的终止检查点
pub const SHARD_END: &str = "SHARD_END";

#[derive(Debug, Clone, Default)]
struct PartitionState {
    checkpoint: Option<String>,
    owner: Option<String>,
    lease_timeout: Option<DateTime<Utc>>,
}

/// 单个源分区的运行时状态
///
/// 由 worker 创建，检查点存储和 processor 共享读写。
#[derive(Debug)]
pub struct PartitionStatus {
    id: String,
    parent_id: Option<String>,
    state: Mutex<PartitionState>,
}

impl PartitionStatus {
    pub fn new(id: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            parent_id,
            state: Mutex::new(PartitionState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn checkpoint(&self) -> Option<String> {
        self.state.lock().checkpoint.clone()
    }

    pub fn set_checkpoint(&self, checkpoint: Option<String>) {
        self.state.lock().checkpoint = checkpoint;
    }

    pub fn owner(&self) -> Option<String> {
        self.state.lock().owner.clone()
    }

    pub fn set_owner(&self, owner: Option<String>) {
        self.state.lock().owner = owner;
    }

    pub fn lease_timeout(&self) -> Option<DateTime<Utc>> {
        self.state.lock().lease_timeout
    }

    pub fn set_lease_timeout(&self, lease_timeout: Option<DateTime<Utc>>) {
        self.state.lock().lease_timeout = lease_timeout;
    }

    /// 原子地设置租约持有者和过期时间
    pub fn assign(&self, owner: &str, lease_timeout: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.owner = Some(owner.to_string());
        state.lease_timeout = Some(lease_timeout);
    }

    /// 是否已写入终止检查点
    pub fn is_finished(&self) -> bool {
        self.state.lock().checkpoint.as_deref() == Some(SHARD_END)
    }
}
