//! 内存检查点存储
//!
//! 不需要跨重启持久化，也只有一个 worker 持有全部分区，
//! 所以租约总是直接授予，时长接近无限。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;

use super::types::CheckpointRecord;
use crate::consumer::{CheckpointError, Checkpointer, PartitionStatus, SHARD_END};

/// 租约时长（天）
const LEASE_DURATION_DAYS: i64 = 365;

/// 内存检查点存储
pub struct InMemoryCheckpointer {
    worker_id: String,
    records: Mutex<HashMap<String, CheckpointRecord>>,
}

impl InMemoryCheckpointer {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// 当前记录数
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// 分区当前保存的检查点
    pub fn checkpoint_of(&self, partition_id: &str) -> Option<String> {
        self.records
            .lock()
            .get(partition_id)
            .and_then(|record| record.position.clone())
    }

    fn save_record(&self, partition_id: &str, record: CheckpointRecord) {
        self.records.lock().insert(partition_id.to_string(), record);
    }

    fn get_record(&self, partition_id: &str) -> Result<CheckpointRecord, CheckpointError> {
        self.records
            .lock()
            .get(partition_id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(partition_id.to_string()))
    }

    fn remove_record(&self, partition_id: &str) {
        self.records.lock().remove(partition_id);
    }

    fn record_from(&self, partition: &PartitionStatus) -> CheckpointRecord {
        CheckpointRecord {
            position: partition.checkpoint(),
            owner: partition.owner().unwrap_or_else(|| self.worker_id.clone()),
            lease_timeout: partition.lease_timeout(),
            parent_id: partition.parent_id().map(str::to_string),
        }
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn init(&self) -> Result<(), CheckpointError> {
        log::debug!("[checkpoint {}] init", self.worker_id);
        Ok(())
    }

    async fn acquire_lease(
        &self,
        partition: &PartitionStatus,
        owner: &str,
    ) -> Result<(), CheckpointError> {
        log::debug!(
            "[checkpoint {}] acquire_lease: partition={} owner={}",
            self.worker_id,
            partition.id(),
            owner
        );

        let lease_timeout = Utc::now() + Duration::days(LEASE_DURATION_DAYS);
        partition.assign(owner, lease_timeout);

        if let Some(record) = self.records.lock().get_mut(partition.id()) {
            record.owner = owner.to_string();
            record.lease_timeout = Some(lease_timeout);
        }

        Ok(())
    }

    async fn save_progress(&self, partition: &PartitionStatus) -> Result<(), CheckpointError> {
        log::debug!(
            "[checkpoint {}] save_progress: partition={} position={:?}",
            self.worker_id,
            partition.id(),
            partition.checkpoint()
        );

        self.save_record(partition.id(), self.record_from(partition));
        Ok(())
    }

    async fn fetch_progress(
        &self,
        partition: &PartitionStatus,
    ) -> Result<CheckpointRecord, CheckpointError> {
        log::debug!(
            "[checkpoint {}] fetch_progress: partition={}",
            self.worker_id,
            partition.id()
        );

        let record = self.get_record(partition.id())?;

        partition.set_checkpoint(record.position.clone());
        partition.set_owner(Some(self.worker_id.clone()));
        partition.set_lease_timeout(record.lease_timeout);

        Ok(record)
    }

    async fn remove_lease(&self, partition_id: &str) -> Result<(), CheckpointError> {
        log::debug!(
            "[checkpoint {}] remove_lease: partition={}",
            self.worker_id,
            partition_id
        );
        self.remove_record(partition_id);
        Ok(())
    }

    async fn remove_owner(&self, partition_id: &str) -> Result<(), CheckpointError> {
        log::debug!(
            "[checkpoint {}] remove_owner: partition={}",
            self.worker_id,
            partition_id
        );
        self.remove_record(partition_id);
        Ok(())
    }

    async fn lease_owner(&self, partition_id: &str) -> Result<String, CheckpointError> {
        self.get_record(partition_id)?;
        Ok(self.worker_id.clone())
    }

    async fn list_active_owners(
        &self,
        partitions: &[Arc<PartitionStatus>],
    ) -> Result<HashMap<String, Vec<Arc<PartitionStatus>>>, CheckpointError> {
        let mut owners: HashMap<String, Vec<Arc<PartitionStatus>>> = HashMap::new();

        for partition in partitions {
            if partition.checkpoint().as_deref() == Some(SHARD_END) {
                continue;
            }

            let owner = partition.owner().ok_or_else(|| {
                log::debug!(
                    "[checkpoint {}] partition not assigned: {}",
                    self.worker_id,
                    partition.id()
                );
                CheckpointError::NotAssigned(partition.id().to_string())
            })?;

            owners.entry(owner).or_default().push(Arc::clone(partition));
        }

        Ok(owners)
    }

    async fn claim_partition(
        &self,
        partition: &PartitionStatus,
        claimant: &str,
    ) -> Result<(), CheckpointError> {
        log::debug!(
            "[checkpoint {}] claim_partition: partition={} claimant={}",
            self.worker_id,
            partition.id(),
            claimant
        );

        match self.fetch_progress(partition).await {
            Ok(_) | Err(CheckpointError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.save_progress(partition).await
    }
}
