//! 记录源
//!
//! `RecordSource` 抽象出一个分区化、有序的上游流：列出分区、
//! 按起点获取迭代器、按迭代器批量读取。`MemorySource` 是进程内实现，
//! 分区和记录由调用方直接写入。

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::{InitialPosition, Record};

/// 单分区默认保留记录数
pub const DEFAULT_RETENTION: usize = 100_000;

/// 记录源错误
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Unknown partition: {0}")]
    UnknownPartition(String),

    #[error("Partition already exists: {0}")]
    DuplicatePartition(String),

    #[error("Partition is closed: {0}")]
    PartitionClosed(String),

    #[error("Invalid iterator: {0}")]
    InvalidIterator(String),

    #[error("Invalid sequence number: {0}")]
    InvalidSequence(String),

    #[error("Empty record")]
    EmptyRecord,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 分区描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub id: String,
    pub parent_id: Option<String>,
}

/// 迭代器起点
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartingPoint {
    Initial(InitialPosition),
    /// 紧接在某个已处理序列号之后
    AfterSequence(String),
}

/// 一次读取的结果
#[derive(Debug, Clone)]
pub struct ReadBatch {
    pub records: Vec<Record>,
    /// `None` 表示分区已读完
    pub next_iterator: Option<String>,
    pub millis_behind_latest: i64,
}

/// 上游记录源
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// worker 启动时调用一次；`ct` 取消时源应停止后台任务
    async fn start(&self, _ct: CancellationToken) -> Result<(), SourceError> {
        Ok(())
    }

    async fn list_partitions(&self) -> Result<Vec<PartitionInfo>, SourceError>;

    async fn iterator(
        &self,
        partition_id: &str,
        start: &StartingPoint,
    ) -> Result<String, SourceError>;

    async fn read(
        &self,
        partition_id: &str,
        iterator: &str,
        limit: usize,
    ) -> Result<ReadBatch, SourceError>;
}

/// 序列号格式：定宽十进制，字典序与数值序一致
pub fn format_sequence(index: u64) -> String {
    format!("{:020}", index)
}

pub fn parse_sequence(sequence: &str) -> Result<u64, SourceError> {
    sequence
        .parse::<u64>()
        .map_err(|_| SourceError::InvalidSequence(sequence.to_string()))
}

#[derive(Debug)]
struct MemPartition {
    parent_id: Option<String>,
    /// 最旧保留记录的绝对下标
    base: u64,
    records: VecDeque<Record>,
    closed: bool,
}

impl MemPartition {
    fn end(&self) -> u64 {
        self.base + self.records.len() as u64
    }
}

/// 进程内记录源
#[derive(Debug)]
pub struct MemorySource {
    retention: usize,
    partitions: RwLock<BTreeMap<String, MemPartition>>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// 每个分区最多保留 `retention` 条记录（至少 1）
    pub fn with_retention(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            partitions: RwLock::new(BTreeMap::new()),
        }
    }

    /// 创建单分区源，分区 ID 为 `partition_id`
    pub fn single(partition_id: &str) -> Arc<Self> {
        let source = Arc::new(Self::new());
        source
            .partitions
            .write()
            .insert(partition_id.to_string(), Self::empty_partition(None));
        source
    }

    fn empty_partition(parent_id: Option<String>) -> MemPartition {
        MemPartition {
            parent_id,
            base: 0,
            records: VecDeque::new(),
            closed: false,
        }
    }

    pub fn create_partition(
        &self,
        partition_id: &str,
        parent_id: Option<&str>,
    ) -> Result<(), SourceError> {
        let mut partitions = self.partitions.write();
        if partitions.contains_key(partition_id) {
            return Err(SourceError::DuplicatePartition(partition_id.to_string()));
        }
        partitions.insert(
            partition_id.to_string(),
            Self::empty_partition(parent_id.map(str::to_string)),
        );
        Ok(())
    }

    /// 写入一条记录，到达时间取当前时间；返回序列号
    pub fn put(&self, partition_id: &str, data: impl Into<Bytes>) -> Result<String, SourceError> {
        self.put_at(partition_id, data, Utc::now())
    }

    pub fn put_at(
        &self,
        partition_id: &str,
        data: impl Into<Bytes>,
        arrival: DateTime<Utc>,
    ) -> Result<String, SourceError> {
        let data = data.into();
        if data.is_empty() {
            return Err(SourceError::EmptyRecord);
        }

        let mut partitions = self.partitions.write();
        let partition = partitions
            .get_mut(partition_id)
            .ok_or_else(|| SourceError::UnknownPartition(partition_id.to_string()))?;

        if partition.closed {
            return Err(SourceError::PartitionClosed(partition_id.to_string()));
        }

        let sequence_number = format_sequence(partition.end());
        partition.records.push_back(Record {
            sequence_number: sequence_number.clone(),
            partition_key: partition_id.to_string(),
            data,
            approximate_arrival: arrival,
        });

        if partition.records.len() > self.retention {
            partition.records.pop_front();
            partition.base += 1;
        }

        Ok(sequence_number)
    }

    /// 关闭分区：已写入的记录读完后迭代器结束
    pub fn close_partition(&self, partition_id: &str) -> Result<(), SourceError> {
        let mut partitions = self.partitions.write();
        let partition = partitions
            .get_mut(partition_id)
            .ok_or_else(|| SourceError::UnknownPartition(partition_id.to_string()))?;
        partition.closed = true;
        Ok(())
    }

    pub fn is_closed(&self, partition_id: &str) -> bool {
        self.partitions
            .read()
            .get(partition_id)
            .map(|p| p.closed)
            .unwrap_or(false)
    }

    /// 分区当前保留的记录数
    pub fn len(&self, partition_id: &str) -> usize {
        self.partitions
            .read()
            .get(partition_id)
            .map(|p| p.records.len())
            .unwrap_or(0)
    }

    fn parse_iterator(iterator: &str) -> Result<u64, SourceError> {
        iterator
            .parse::<u64>()
            .map_err(|_| SourceError::InvalidIterator(iterator.to_string()))
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn list_partitions(&self) -> Result<Vec<PartitionInfo>, SourceError> {
        Ok(self
            .partitions
            .read()
            .iter()
            .map(|(id, partition)| PartitionInfo {
                id: id.clone(),
                parent_id: partition.parent_id.clone(),
            })
            .collect())
    }

    async fn iterator(
        &self,
        partition_id: &str,
        start: &StartingPoint,
    ) -> Result<String, SourceError> {
        let partitions = self.partitions.read();
        let partition = partitions
            .get(partition_id)
            .ok_or_else(|| SourceError::UnknownPartition(partition_id.to_string()))?;

        let position = match start {
            StartingPoint::Initial(InitialPosition::Latest) => partition.end(),
            StartingPoint::Initial(InitialPosition::Earliest) => partition.base,
            StartingPoint::Initial(InitialPosition::AtTimestamp(ts)) => partition
                .records
                .iter()
                .position(|r| r.approximate_arrival >= *ts)
                .map(|i| partition.base + i as u64)
                .unwrap_or_else(|| partition.end()),
            StartingPoint::AfterSequence(sequence) => parse_sequence(sequence)? + 1,
        };

        Ok(position.to_string())
    }

    async fn read(
        &self,
        partition_id: &str,
        iterator: &str,
        limit: usize,
    ) -> Result<ReadBatch, SourceError> {
        let position = Self::parse_iterator(iterator)?;

        let partitions = self.partitions.read();
        let partition = partitions
            .get(partition_id)
            .ok_or_else(|| SourceError::UnknownPartition(partition_id.to_string()))?;

        // 已被淘汰的位置从最旧保留记录继续
        let start = position.max(partition.base);
        let end = partition.end();
        let take = (end.saturating_sub(start) as usize).min(limit);

        let records: Vec<Record> = partition
            .records
            .iter()
            .skip((start - partition.base) as usize)
            .take(take)
            .cloned()
            .collect();

        let next = start + records.len() as u64;
        let next_iterator = if partition.closed && next >= end {
            None
        } else {
            Some(next.to_string())
        };

        let millis_behind_latest = match records.last() {
            Some(last) if next < end => (Utc::now() - last.approximate_arrival)
                .num_milliseconds()
                .max(0),
            _ => 0,
        };

        Ok(ReadBatch {
            records,
            next_iterator,
            millis_behind_latest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_iterator_positions() {
        let source = MemorySource::new();
        source.create_partition("p0", None).unwrap();
        source
            .put_at("p0", "a", Utc.timestamp_opt(100, 0).unwrap())
            .unwrap();
        source
            .put_at("p0", "b", Utc.timestamp_opt(200, 0).unwrap())
            .unwrap();

        let latest = StartingPoint::Initial(InitialPosition::Latest);
        let earliest = StartingPoint::Initial(InitialPosition::Earliest);
        let at = |secs| {
            StartingPoint::Initial(InitialPosition::AtTimestamp(
                Utc.timestamp_opt(secs, 0).unwrap(),
            ))
        };

        assert_eq!(source.iterator("p0", &latest).await.unwrap(), "2");
        assert_eq!(source.iterator("p0", &earliest).await.unwrap(), "0");
        assert_eq!(source.iterator("p0", &at(150)).await.unwrap(), "1");
        assert_eq!(source.iterator("p0", &at(999)).await.unwrap(), "2");
        assert_eq!(
            source
                .iterator("p0", &StartingPoint::AfterSequence(format_sequence(0)))
                .await
                .unwrap(),
            "1"
        );
        assert!(matches!(
            source.iterator("nope", &latest).await,
            Err(SourceError::UnknownPartition(_))
        ));
    }

    #[tokio::test]
    async fn test_read_in_batches_until_closed() {
        let source = MemorySource::new();
        source.create_partition("p0", None).unwrap();
        for i in 0..5 {
            source.put("p0", format!("{}", i)).unwrap();
        }

        let batch = source.read("p0", "0", 3).await.unwrap();
        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.records[0].sequence_number, format_sequence(0));
        assert_eq!(batch.next_iterator.as_deref(), Some("3"));

        source.close_partition("p0").unwrap();
        assert!(matches!(
            source.put("p0", "x"),
            Err(SourceError::PartitionClosed(_))
        ));

        let batch = source.read("p0", "3", 10).await.unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[1].data, "4");
        assert_eq!(batch.next_iterator, None);
        assert_eq!(batch.millis_behind_latest, 0);
    }

    #[tokio::test]
    async fn test_retention_trims_oldest() {
        let source = MemorySource::with_retention(2);
        source.create_partition("p0", None).unwrap();
        for i in 0..4 {
            source.put("p0", format!("{}", i)).unwrap();
        }
        assert_eq!(source.len("p0"), 2);

        let batch = source.read("p0", "0", 10).await.unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0].sequence_number, format_sequence(2));
        assert_eq!(batch.next_iterator.as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_partitions_listed_with_parents() {
        let source = MemorySource::new();
        source.create_partition("parent", None).unwrap();
        source.create_partition("child", Some("parent")).unwrap();
        assert!(matches!(
            source.create_partition("child", None),
            Err(SourceError::DuplicatePartition(_))
        ));

        let partitions = source.list_partitions().await.unwrap();
        assert_eq!(
            partitions,
            vec![
                PartitionInfo {
                    id: "child".to_string(),
                    parent_id: Some("parent".to_string()),
                },
                PartitionInfo {
                    id: "parent".to_string(),
                    parent_id: None,
                },
            ]
        );
    }

    #[test]
    fn test_rejects_empty_and_bad_iterators() {
        let source = MemorySource::single("p0");
        assert!(matches!(source.put("p0", ""), Err(SourceError::EmptyRecord)));
        assert!(matches!(
            parse_sequence("abc"),
            Err(SourceError::InvalidSequence(_))
        ));
    }
}
