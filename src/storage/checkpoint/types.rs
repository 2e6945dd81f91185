//! 检查点类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 单个分区的检查点记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// 最后处理到的位置（序列号或 `SHARD_END`）
    pub position: Option<String>,

    /// 租约持有者
    pub owner: String,

    /// 租约过期时间
    pub lease_timeout: Option<DateTime<Utc>>,

    /// 父分区 ID（分区分裂/合并时存在）
    pub parent_id: Option<String>,
}
