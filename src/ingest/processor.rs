//! 路由记录处理器
//!
//! 把上游批次解码后追加到路由日志，并在同一把索引写锁下
//! 记录每个新偏移量的事件时间。批次处理完后按最后一条记录的序列号
//! 提交一次检查点。

use std::sync::Arc;

use async_trait::async_trait;

use super::envelope::{decode, SkipReason};
use crate::consumer::{
    InitializationInput, ProcessRecordsInput, Record, RecordProcessor, RecordProcessorFactory,
    ShutdownInput, ShutdownReason,
};
use crate::observability::{
    LabeledTimer, BATCHES_TOTAL, BATCH_LATENCY, LOG_LATEST_OFFSET, RECORDS_INGESTED,
};
use crate::record_skipped;
use crate::storage::index::SharedTimestampIndex;
use crate::storage::MemLog;

/// 单分区处理器，写入所属路由的日志和索引
pub struct RouteRecordProcessor {
    route: Arc<str>,
    log: Arc<MemLog>,
    index: Arc<SharedTimestampIndex>,
    partition_id: String,
}

impl RouteRecordProcessor {
    pub fn new(route: Arc<str>, log: Arc<MemLog>, index: Arc<SharedTimestampIndex>) -> Self {
        Self {
            route,
            log,
            index,
            partition_id: String::new(),
        }
    }

    fn skip(&self, reason: &SkipReason) {
        log::warn!("[route {}] skipping an event: {}", self.route, reason);
        record_skipped!(&*self.route, reason.label());
    }

    /// 处理一批记录，返回写入日志的条数
    ///
    /// 整批持有索引写锁。索引拒绝新偏移量说明日志与索引已不一致，
    /// 此时直接 panic。
    pub fn apply_batch(&self, records: &[Record]) -> usize {
        let mut ingested = 0;
        let mut last_offset = None;

        let mut index = self.index.write();
        for record in records {
            let envelope = match decode(&record.data) {
                Ok(envelope) => envelope,
                Err(reason) => {
                    self.skip(&reason);
                    continue;
                }
            };

            let offset = match self.log.write(envelope.payload) {
                Ok(offset) => offset,
                Err(e) => {
                    log::error!(
                        "[route {}] skipping an event, unable to write it to the log: {}",
                        self.route,
                        e
                    );
                    record_skipped!(&*self.route, "log_write");
                    continue;
                }
            };

            if let Err(e) = index.add(offset, envelope.timestamp) {
                log::error!(
                    "[route {}] timestamp index rejected offset {}: {}. Exiting!",
                    self.route,
                    offset,
                    e
                );
                panic!("timestamp index out of sync with log: {}", e);
            }

            ingested += 1;
            last_offset = Some(offset);
        }
        drop(index);

        if let Some(offset) = last_offset {
            RECORDS_INGESTED
                .with_label_values(&[&*self.route])
                .inc_by(ingested as u64);
            LOG_LATEST_OFFSET
                .with_label_values(&[&*self.route])
                .set(offset);
        }

        ingested
    }
}

#[async_trait]
impl RecordProcessor for RouteRecordProcessor {
    async fn initialize(&mut self, input: InitializationInput) {
        log::debug!(
            "[route {}] processing partition {} at checkpoint {}",
            self.route,
            input.partition_id,
            input.checkpoint.as_deref().unwrap_or("<none>")
        );
        self.partition_id = input.partition_id;
    }

    async fn process_records(&mut self, input: ProcessRecordsInput) {
        let Some(last) = input.records.last() else {
            return;
        };

        let timer = LabeledTimer::new(BATCH_LATENCY.clone(), vec![self.route.to_string()]);
        self.apply_batch(&input.records);
        timer.observe();
        BATCHES_TOTAL.with_label_values(&[&*self.route]).inc();

        if let (Some(entry), Some(exit)) = (input.cache_entry_time, input.cache_exit_time) {
            log::debug!(
                "[route {}] checkpoint progress at {}, millis behind latest = {}, delivery time = {:?}",
                self.route,
                last.sequence_number,
                input.millis_behind_latest,
                exit.saturating_duration_since(entry)
            );
        }

        if let Some(checkpointer) = input.checkpointer {
            if let Err(e) = checkpointer.checkpoint(Some(&last.sequence_number)).await {
                log::warn!(
                    "[route {}] checkpoint failed for partition {}: {}",
                    self.route,
                    checkpointer.partition_id(),
                    e
                );
            }
        }
    }

    async fn shutdown(&mut self, input: ShutdownInput) {
        log::info!(
            "[route {}] partition {} shutdown, reason: {}",
            self.route,
            self.partition_id,
            input.reason
        );

        // 分区读完必须写入终止检查点，否则子分区不会开始
        if input.reason == ShutdownReason::Terminate {
            if let Err(e) = input.checkpointer.checkpoint(None).await {
                log::warn!(
                    "[route {}] terminal checkpoint failed for partition {}: {}",
                    self.route,
                    input.checkpointer.partition_id(),
                    e
                );
            }
        }
    }
}

/// 为路由的每个分区创建 [`RouteRecordProcessor`]
pub struct RouteProcessorFactory {
    route: Arc<str>,
    log: Arc<MemLog>,
    index: Arc<SharedTimestampIndex>,
}

impl RouteProcessorFactory {
    pub fn new(route: &str, log: Arc<MemLog>, index: Arc<SharedTimestampIndex>) -> Self {
        Self {
            route: Arc::from(route),
            log,
            index,
        }
    }
}

impl RecordProcessorFactory for RouteProcessorFactory {
    fn create_processor(&self) -> Box<dyn RecordProcessor> {
        Box::new(RouteRecordProcessor::new(
            Arc::clone(&self.route),
            Arc::clone(&self.log),
            Arc::clone(&self.index),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{Checkpointer, PartitionStatus, RecordCheckpointer, SHARD_END};
    use crate::storage::checkpoint::InMemoryCheckpointer;
    use crate::storage::LogError;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use tokio_util::sync::CancellationToken;

    const UNPARSEABLE_EVENT: &str = "bogus";
    const EVENT_WITHOUT_TIME: &str = r#"{"detail":{}}"#;
    const EVENT_WITHOUT_DETAIL: &str = r#"{"time":"1970-01-01T00:00:00.000Z"}"#;
    const GOOD_EVENT_1: &str =
        r#"{"time":"1970-01-01T00:00:00.000Z","detail":{"good":true,"event":1}}"#;
    const GOOD_EVENT_2: &str =
        r#"{"time":"1970-01-01T00:00:00.001Z","detail":{"good":true,"event":2}}"#;
    const GOOD_EVENT_3: &str =
        r#"{"time":"1970-01-01T00:00:00.001Z","detail":{"good":true,"event":3}}"#;

    fn record(seq: u64, data: &'static str) -> crate::consumer::Record {
        crate::consumer::Record {
            sequence_number: format!("{:020}", seq),
            partition_key: "p0".to_string(),
            data: Bytes::from_static(data.as_bytes()),
            approximate_arrival: Utc::now(),
        }
    }

    fn fixture() -> (Arc<MemLog>, Arc<SharedTimestampIndex>, RouteRecordProcessor) {
        let log = Arc::new(MemLog::new(100, CancellationToken::new()).unwrap());
        let index = Arc::new(SharedTimestampIndex::new(100).unwrap());
        let processor =
            RouteRecordProcessor::new(Arc::from("/test"), log.clone(), index.clone());
        (log, index, processor)
    }

    fn batch(records: Vec<crate::consumer::Record>, cp: Option<RecordCheckpointer>) -> ProcessRecordsInput {
        ProcessRecordsInput {
            records,
            millis_behind_latest: 0,
            cache_entry_time: None,
            cache_exit_time: None,
            checkpointer: cp,
        }
    }

    #[tokio::test]
    async fn test_skips_invalid_events_and_keeps_going() {
        let (log, index, mut processor) = fixture();

        processor
            .process_records(batch(
                vec![
                    record(0, UNPARSEABLE_EVENT),
                    record(1, EVENT_WITHOUT_TIME),
                    record(2, EVENT_WITHOUT_DETAIL),
                    record(3, GOOD_EVENT_1),
                    record(4, GOOD_EVENT_2),
                ],
                None,
            ))
            .await;

        assert_eq!(log.read(0).unwrap().data, r#"{"event":1,"good":true}"#);
        assert_eq!(log.read(1).unwrap().data, r#"{"event":2,"good":true}"#);
        assert!(matches!(log.read(2), Err(LogError::FutureOffset { .. })));

        processor
            .process_records(batch(vec![record(5, GOOD_EVENT_3)], None))
            .await;

        assert_eq!(log.read(2).unwrap().data, r#"{"event":3,"good":true}"#);
        assert!(log.read(3).is_err());

        // 索引与日志偏移一致
        assert_eq!(index.len(), 3);
        assert_eq!(index.nearest_offset(Utc.timestamp_millis_opt(0).unwrap()), Some(0));
        assert_eq!(index.nearest_offset(Utc.timestamp_millis_opt(1).unwrap()), Some(1));
    }

    #[tokio::test]
    async fn test_checkpoints_last_sequence_of_batch() {
        let (_log, _index, mut processor) = fixture();
        let store = Arc::new(InMemoryCheckpointer::new("worker-1"));
        let status = Arc::new(PartitionStatus::new("p0", None));
        let cp = RecordCheckpointer::new(status.clone(), store.clone());

        processor
            .process_records(batch(
                vec![record(7, GOOD_EVENT_1), record(8, UNPARSEABLE_EVENT)],
                Some(cp.clone()),
            ))
            .await;
        assert_eq!(status.checkpoint(), Some(format!("{:020}", 8)));

        // 空批次不提交
        processor.process_records(batch(vec![], Some(cp))).await;
        let saved = store.fetch_progress(&PartitionStatus::new("p0", None)).await.unwrap();
        assert_eq!(saved.position, Some(format!("{:020}", 8)));
    }

    #[tokio::test]
    async fn test_shutdown_checkpoints_only_on_terminate() {
        let (_log, _index, mut processor) = fixture();
        let store = Arc::new(InMemoryCheckpointer::new("worker-1"));
        let status = Arc::new(PartitionStatus::new("p0", None));
        let cp = RecordCheckpointer::new(status.clone(), store);

        processor
            .initialize(InitializationInput {
                partition_id: "p0".to_string(),
                checkpoint: None,
            })
            .await;

        processor
            .shutdown(ShutdownInput {
                reason: ShutdownReason::Requested,
                checkpointer: cp.clone(),
            })
            .await;
        assert_eq!(status.checkpoint(), None);

        processor
            .shutdown(ShutdownInput {
                reason: ShutdownReason::Terminate,
                checkpointer: cp,
            })
            .await;
        assert_eq!(status.checkpoint().as_deref(), Some(SHARD_END));
        assert!(status.is_finished());
    }

    #[test]
    fn test_closed_log_skips_without_indexing() {
        let ct = CancellationToken::new();
        let log = Arc::new(MemLog::new(10, ct.clone()).unwrap());
        let index = Arc::new(SharedTimestampIndex::new(10).unwrap());
        let processor = RouteRecordProcessor::new(Arc::from("/closed"), log, index.clone());

        ct.cancel();
        assert_eq!(processor.apply_batch(&[record(0, GOOD_EVENT_1)]), 0);
        assert!(index.is_empty());
    }

    #[test]
    #[should_panic(expected = "timestamp index out of sync")]
    fn test_index_mismatch_is_fatal() {
        let (_log, index, processor) = fixture();
        index.add(5, Utc::now()).unwrap();
        processor.apply_batch(&[record(0, GOOD_EVENT_1)]);
    }

    #[test]
    fn test_factory_shares_log_and_index() {
        let log = Arc::new(MemLog::new(10, CancellationToken::new()).unwrap());
        let index = Arc::new(SharedTimestampIndex::new(10).unwrap());
        let factory = RouteProcessorFactory::new("/shared", log.clone(), index.clone());

        let _first = factory.create_processor();
        let _second = factory.create_processor();
        assert_eq!(Arc::strong_count(&log), 4);
        assert_eq!(Arc::strong_count(&index), 4);
    }
}
