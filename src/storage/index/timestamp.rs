//! 时间戳 → 偏移量索引
//!
//! 设计理念：
//! - 固定容量，按偏移量 FIFO 淘汰最旧条目
//! - 偏移量必须连续递增地写入（第一次写入确定基线）
//! - `offset → timestamp` 点查 + `(timestamp, offset)` 有序集合做范围查找
//!
//! 查找策略（先向前、再向后）：
//! 1. 返回时间戳 ≥ 查询值的最早条目（同一时间戳取最小偏移量）
//! 2. 若不存在，返回时间戳 < 查询值的最新条目
//! 3. 索引为空时返回 `None`

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::storage::memlog::Offset;

/// 索引错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("Invalid capacity: {0} (must be greater than 0)")]
    InvalidCapacity(usize),

    #[error("Offset out of order: {0}")]
    OutOfOrder(String),

    #[error("Corrupt index state: {0}")]
    CorruptState(String),
}

/// 时间戳索引
///
/// 本身不做同步；并发访问请通过 [`SharedTimestampIndex`]。
#[derive(Debug)]
pub struct TimestampIndex {
    /// 最多保留的条目数
    capacity: usize,

    /// 最后写入的偏移量（用于连续性检查）
    last_offset: Option<Offset>,

    /// 偏移量 → 时间戳
    offset_to_timestamp: HashMap<Offset, DateTime<Utc>>,

    /// (时间戳, 偏移量) 有序集合
    ordered: BTreeSet<(DateTime<Utc>, Offset)>,
}

impl TimestampIndex {
    /// 创建指定容量的索引
    pub fn new(capacity: usize) -> Result<Self, IndexError> {
        if capacity == 0 {
            return Err(IndexError::InvalidCapacity(capacity));
        }

        Ok(Self {
            capacity,
            last_offset: None,
            offset_to_timestamp: HashMap::with_capacity(capacity.min(1 << 16)),
            ordered: BTreeSet::new(),
        })
    }

    /// 添加 (offset, timestamp)
    ///
    /// 偏移量必须恰好比上一次大 1。容量已满时淘汰 `offset - capacity`。
    pub fn add(&mut self, offset: Offset, timestamp: DateTime<Utc>) -> Result<(), IndexError> {
        if offset < 0 {
            return Err(IndexError::OutOfOrder(format!(
                "offsets must be non-negative, got {}",
                offset
            )));
        }

        if let Some(last) = self.last_offset {
            if last.checked_add(1) != Some(offset) {
                return Err(IndexError::OutOfOrder(format!(
                    "cannot add offset {} when last offset was {}",
                    offset, last
                )));
            }
        }

        if self.offset_to_timestamp.len() == self.capacity {
            // 已满：淘汰最旧条目
            let oldest = offset - self.capacity as Offset;
            let oldest_ts = self.offset_to_timestamp.remove(&oldest).ok_or_else(|| {
                IndexError::CorruptState(format!("old offset to remove {} not found", oldest))
            })?;

            if !self.ordered.remove(&(oldest_ts, oldest)) {
                return Err(IndexError::CorruptState(format!(
                    "timestamp {} for old offset to remove {} not found",
                    oldest_ts.to_rfc3339(),
                    oldest
                )));
            }
        }

        self.offset_to_timestamp.insert(offset, timestamp);
        self.ordered.insert((timestamp, offset));
        self.last_offset = Some(offset);

        Ok(())
    }

    /// 查找最接近给定时间戳的偏移量
    pub fn nearest_offset(&self, timestamp: DateTime<Utc>) -> Option<Offset> {
        let key = (timestamp, Offset::MIN);

        // 向前
        if let Some((_, offset)) = self.ordered.range(key..).next() {
            return Some(*offset);
        }

        // 向后
        self.ordered
            .range(..key)
            .next_back()
            .map(|(_, offset)| *offset)
    }

    /// 查询偏移量对应的时间戳
    pub fn timestamp_of(&self, offset: Offset) -> Option<DateTime<Utc>> {
        self.offset_to_timestamp.get(&offset).copied()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.offset_to_timestamp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offset_to_timestamp.is_empty()
    }

    /// 最后写入的偏移量
    pub fn last_offset(&self) -> Option<Offset> {
        self.last_offset
    }

    /// 当前保留的最旧偏移量
    pub fn first_offset(&self) -> Option<Offset> {
        self.last_offset
            .map(|last| last - self.offset_to_timestamp.len() as Offset + 1)
            .filter(|_| !self.is_empty())
    }
}

/// 带锁的时间戳索引
///
/// 写入方持有写锁完成一整批 `add`，查找方持有读锁，二者不会交错。
#[derive(Debug)]
pub struct SharedTimestampIndex {
    inner: RwLock<TimestampIndex>,
}

impl SharedTimestampIndex {
    pub fn new(capacity: usize) -> Result<Self, IndexError> {
        Ok(Self {
            inner: RwLock::new(TimestampIndex::new(capacity)?),
        })
    }

    /// 获取写锁（一个批次期间持有）
    pub fn write(&self) -> RwLockWriteGuard<'_, TimestampIndex> {
        self.inner.write()
    }

    /// 获取读锁
    pub fn read(&self) -> RwLockReadGuard<'_, TimestampIndex> {
        self.inner.read()
    }

    /// 加锁添加单个条目
    pub fn add(&self, offset: Offset, timestamp: DateTime<Utc>) -> Result<(), IndexError> {
        self.inner.write().add(offset, timestamp)
    }

    /// 加读锁查找
    pub fn nearest_offset(&self, timestamp: DateTime<Utc>) -> Option<Offset> {
        self.inner.read().nearest_offset(timestamp)
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
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
    fn test_zero_capacity_rejected() {
        assert_eq!(
            TimestampIndex::new(0).unwrap_err(),
            IndexError::InvalidCapacity(0)
        );
    }

    #[test]
    fn test_nearest_offset_policy() {
        let mut index = TimestampIndex::new(2).unwrap();

        // []
        assert_eq!(index.nearest_offset(ms(0)), None);

        // [0 → 100]
        index.add(0, ms(100)).unwrap();
        assert_eq!(index.nearest_offset(ms(0)), Some(0));
        assert_eq!(index.nearest_offset(ms(100)), Some(0));
        assert_eq!(index.nearest_offset(ms(1_000)), Some(0));

        // [0 → 100, 1 → 500]
        index.add(1, ms(500)).unwrap();
        assert_eq!(index.nearest_offset(ms(0)), Some(0));
        assert_eq!(index.nearest_offset(ms(100)), Some(0));
        assert_eq!(index.nearest_offset(ms(250)), Some(1));
        assert_eq!(index.nearest_offset(ms(500)), Some(1));
        assert_eq!(index.nearest_offset(ms(600)), Some(1));
        assert_eq!(index.nearest_offset(ms(1_000)), Some(1));

        // 0 被淘汰: [1 → 500, 2 → 250]
        index.add(2, ms(250)).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.timestamp_of(0), None);
        assert_eq!(index.nearest_offset(ms(0)), Some(2));
        assert_eq!(index.nearest_offset(ms(100)), Some(2));
        assert_eq!(index.nearest_offset(ms(250)), Some(2));
        assert_eq!(index.nearest_offset(ms(300)), Some(1));
        assert_eq!(index.nearest_offset(ms(500)), Some(1));
        assert_eq!(index.nearest_offset(ms(1_000)), Some(1));
    }

    #[test]
    fn test_ties_resolve_to_smallest_offset() {
        let mut index = TimestampIndex::new(10).unwrap();
        index.add(5, ms(100)).unwrap();
        index.add(6, ms(200)).unwrap();
        index.add(7, ms(200)).unwrap();
        index.add(8, ms(200)).unwrap();

        assert_eq!(index.nearest_offset(ms(150)), Some(6));
        assert_eq!(index.nearest_offset(ms(200)), Some(6));
        assert_eq!(index.nearest_offset(ms(300)), Some(8));
    }

    #[test]
    fn test_contiguity() {
        let mut index = TimestampIndex::new(4).unwrap();

        assert!(matches!(
            index.add(-1, ms(0)),
            Err(IndexError::OutOfOrder(_))
        ));

        // 第一次写入确定基线
        index.add(10, ms(0)).unwrap();
        assert_eq!(index.first_offset(), Some(10));

        // 重复
        assert!(matches!(
            index.add(10, ms(0)),
            Err(IndexError::OutOfOrder(_))
        ));
        // 空洞
        assert!(matches!(
            index.add(12, ms(0)),
            Err(IndexError::OutOfOrder(_))
        ));
        // 回退
        assert!(matches!(index.add(9, ms(0)), Err(IndexError::OutOfOrder(_))));

        index.add(11, ms(0)).unwrap();
        assert_eq!(index.last_offset(), Some(11));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_bounded_retention() {
        let capacity = 16;
        let total = 100;
        let mut index = TimestampIndex::new(capacity).unwrap();

        for offset in 0..total {
            index.add(offset, ms(offset * 10)).unwrap();
        }

        assert_eq!(index.len(), capacity);
        assert_eq!(index.first_offset(), Some(total - capacity as Offset));

        for query in [0, 5, 100, 500, 840, 845, 990, 5_000] {
            let offset = index.nearest_offset(ms(query)).unwrap();
            assert!(offset >= total - capacity as Offset, "query {} → {}", query, offset);
        }
    }

    #[test]
    fn test_shared_index_batch_guard() {
        let shared = SharedTimestampIndex::new(3).unwrap();

        {
            let mut guard = shared.write();
            for offset in 0..5 {
                guard.add(offset, ms(offset * 100)).unwrap();
            }
        }

        assert_eq!(shared.len(), 3);
        assert_eq!(shared.nearest_offset(ms(0)), Some(2));
        assert_eq!(shared.nearest_offset(ms(1_000)), Some(4));
        assert!(shared.add(7, ms(700)).is_err());
        shared.add(5, ms(500)).unwrap();
        assert_eq!(shared.read().first_offset(), Some(3));
    }
}
