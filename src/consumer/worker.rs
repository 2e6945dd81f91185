//! 单进程分区 worker
//!
//! 在一个 [`RecordSource`] 之上实现 [`Worker`] 契约：
//!
//! - 启动时初始化检查点存储和记录源，然后后台运行分区同步循环
//! - 同步循环周期性列出分区；父分区读完（或已不在列表中）之后才启动子分区
//! - 每个分区一个消费任务：接管租约 → 确定起点 → 批量读取 → 交给 processor
//! - 分区读完时以 `Terminate` 关闭 processor；worker 停止时以 `Requested` 关闭
//!
//! processor 内部 panic（例如索引损坏）视为致命错误，进程直接终止。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::source::{PartitionInfo, RecordSource, StartingPoint};
use super::{
    Checkpointer, InitialPosition, InitializationInput, PartitionStatus, ProcessRecordsInput,
    RecordCheckpointer, RecordProcessor, RecordProcessorFactory, ShutdownInput, ShutdownReason,
    Worker, WorkerBuilder, WorkerError, SHARD_END,
};
use crate::storage::checkpoint::InMemoryCheckpointer;

/// worker 配置
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// 租约持有者 ID
    pub worker_id: String,
    /// 没有检查点的分区从哪里开始
    pub initial_position: InitialPosition,
    /// 空读之后的等待时间
    pub poll_interval: Duration,
    /// 重新列出分区的间隔
    pub partition_sync_interval: Duration,
    /// 单次读取的最大记录数
    pub max_records: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("stream2sse-{}", uuid::Uuid::new_v4()),
            initial_position: InitialPosition::Latest,
            poll_interval: Duration::from_millis(1000),
            partition_sync_interval: Duration::from_millis(1000),
            max_records: 10_000,
        }
    }
}

/// [`PartitionWorker`] 的构造器
pub struct PartitionWorkerBuilder {
    source: Arc<dyn RecordSource>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    config: WorkerConfig,
}

impl PartitionWorkerBuilder {
    pub fn new(source: Arc<dyn RecordSource>, config: WorkerConfig) -> Self {
        Self {
            source,
            checkpointer: None,
            config,
        }
    }

    /// 指定检查点存储；默认使用以 worker ID 为持有者的内存存储
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }
}

impl WorkerBuilder for PartitionWorkerBuilder {
    fn build(
        self: Box<Self>,
        factory: Arc<dyn RecordProcessorFactory>,
        ct: CancellationToken,
    ) -> Arc<dyn Worker> {
        let checkpointer = self.checkpointer.unwrap_or_else(|| {
            Arc::new(InMemoryCheckpointer::new(self.config.worker_id.clone()))
        });

        Arc::new(PartitionWorker::new(
            self.source,
            checkpointer,
            factory,
            self.config,
            ct.child_token(),
        ))
    }
}

struct WorkerContext {
    source: Arc<dyn RecordSource>,
    checkpointer: Arc<dyn Checkpointer>,
    factory: Arc<dyn RecordProcessorFactory>,
    config: WorkerConfig,
    ct: CancellationToken,
}

/// 单进程分区 worker
pub struct PartitionWorker {
    ctx: Arc<WorkerContext>,
    started: AtomicBool,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionWorker {
    pub fn new(
        source: Arc<dyn RecordSource>,
        checkpointer: Arc<dyn Checkpointer>,
        factory: Arc<dyn RecordProcessorFactory>,
        config: WorkerConfig,
        ct: CancellationToken,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                source,
                checkpointer,
                factory,
                config,
                ct,
            }),
            started: AtomicBool::new(false),
            sync_task: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.ctx.config.worker_id
    }
}

#[async_trait]
impl Worker for PartitionWorker {
    async fn start(&self) -> Result<(), WorkerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyStarted);
        }

        let ctx = &self.ctx;
        ctx.checkpointer.init().await?;
        ctx.source.start(ctx.ct.clone()).await?;
        let partitions = ctx.source.list_partitions().await?;

        log::info!(
            "[worker {}] started with {} partition(s)",
            ctx.config.worker_id,
            partitions.len()
        );

        let handle = tokio::spawn(sync_partitions(Arc::clone(ctx), partitions));
        *self.sync_task.lock() = Some(handle);

        Ok(())
    }

    async fn shutdown(&self) {
        self.ctx.ct.cancel();

        let handle = self.sync_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!(
                    "[worker {}] partition sync task failed: {}",
                    self.ctx.config.worker_id,
                    e
                );
            }
        }

        log::info!("[worker {}] stopped", self.ctx.config.worker_id);
    }
}

fn check_consumer_exit(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            log::error!("partition consumer panicked, terminating: {}", e);
            std::process::abort();
        }
    }
}

/// 分区同步循环：发现新分区并为其启动消费任务
async fn sync_partitions(ctx: Arc<WorkerContext>, initial: Vec<PartitionInfo>) {
    let mut statuses: HashMap<String, Arc<PartitionStatus>> = HashMap::new();
    let mut consumers = JoinSet::new();
    let mut listed = initial;

    loop {
        spawn_ready(&ctx, &listed, &mut statuses, &mut consumers);

        tokio::select! {
            _ = ctx.ct.cancelled() => break,
            Some(result) = consumers.join_next() => check_consumer_exit(result),
            _ = tokio::time::sleep(ctx.config.partition_sync_interval) => {
                match ctx.source.list_partitions().await {
                    Ok(partitions) => listed = partitions,
                    Err(e) => log::warn!(
                        "[worker {}] listing partitions failed: {}",
                        ctx.config.worker_id,
                        e
                    ),
                }
            }
        }
    }

    while let Some(result) = consumers.join_next().await {
        check_consumer_exit(result);
    }
}

fn spawn_ready(
    ctx: &Arc<WorkerContext>,
    listed: &[PartitionInfo],
    statuses: &mut HashMap<String, Arc<PartitionStatus>>,
    consumers: &mut JoinSet<()>,
) {
    let listed_ids: HashSet<&str> = listed.iter().map(|p| p.id.as_str()).collect();

    for partition in listed {
        if statuses.contains_key(&partition.id) {
            continue;
        }

        // 父分区仍在列表中时，必须先读完
        if let Some(parent) = partition.parent_id.as_deref() {
            let parent_done = statuses
                .get(parent)
                .map(|s| s.is_finished())
                .unwrap_or(false);
            if listed_ids.contains(parent) && !parent_done {
                continue;
            }
        }

        let status = Arc::new(PartitionStatus::new(
            partition.id.clone(),
            partition.parent_id.clone(),
        ));
        statuses.insert(partition.id.clone(), Arc::clone(&status));
        consumers.spawn(consume_partition(Arc::clone(ctx), status));
    }
}

/// 可被取消的等待；返回 false 表示已取消
async fn pause(ct: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = ct.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

async fn close_processor(
    processor: &mut Box<dyn RecordProcessor>,
    reason: ShutdownReason,
    checkpointer: RecordCheckpointer,
) {
    processor
        .shutdown(ShutdownInput {
            reason,
            checkpointer,
        })
        .await;
}

/// 单个分区的消费任务
async fn consume_partition(ctx: Arc<WorkerContext>, status: Arc<PartitionStatus>) {
    let partition_id = status.id().to_string();
    let owner = ctx.config.worker_id.as_str();

    if let Err(e) = ctx.checkpointer.claim_partition(&status, owner).await {
        log::error!("[partition {}] claim failed: {}", partition_id, e);
        return;
    }
    if let Err(e) = ctx.checkpointer.acquire_lease(&status, owner).await {
        log::error!("[partition {}] lease failed: {}", partition_id, e);
        return;
    }

    let checkpoint = status.checkpoint();
    if checkpoint.as_deref() == Some(SHARD_END) {
        log::info!("[partition {}] already finished", partition_id);
        return;
    }

    let start = match &checkpoint {
        Some(sequence) => StartingPoint::AfterSequence(sequence.clone()),
        None => StartingPoint::Initial(ctx.config.initial_position),
    };

    let mut iterator = match ctx.source.iterator(&partition_id, &start).await {
        Ok(iterator) => iterator,
        Err(e) => {
            log::error!("[partition {}] cannot get iterator: {}", partition_id, e);
            return;
        }
    };

    let record_checkpointer = RecordCheckpointer::new(Arc::clone(&status), Arc::clone(&ctx.checkpointer));
    let mut processor = ctx.factory.create_processor();
    processor
        .initialize(InitializationInput {
            partition_id: partition_id.clone(),
            checkpoint,
        })
        .await;

    loop {
        let read = tokio::select! {
            _ = ctx.ct.cancelled() => {
                close_processor(&mut processor, ShutdownReason::Requested, record_checkpointer).await;
                return;
            }
            read = ctx.source.read(&partition_id, &iterator, ctx.config.max_records) => read,
        };

        let batch = match read {
            Ok(batch) => batch,
            Err(e) => {
                log::warn!("[partition {}] read failed: {}", partition_id, e);
                if !pause(&ctx.ct, ctx.config.poll_interval).await {
                    close_processor(&mut processor, ShutdownReason::Requested, record_checkpointer).await;
                    return;
                }
                continue;
            }
        };

        let cache_entry_time = Instant::now();
        let had_records = !batch.records.is_empty();

        if had_records {
            processor
                .process_records(ProcessRecordsInput {
                    records: batch.records,
                    millis_behind_latest: batch.millis_behind_latest,
                    cache_entry_time: Some(cache_entry_time),
                    cache_exit_time: Some(Instant::now()),
                    checkpointer: Some(record_checkpointer.clone()),
                })
                .await;
        }

        match batch.next_iterator {
            Some(next) => iterator = next,
            None => {
                log::info!("[partition {}] reached end of partition", partition_id);
                close_processor(&mut processor, ShutdownReason::Terminate, record_checkpointer).await;
                return;
            }
        }

        if !had_records && !pause(&ctx.ct, ctx.config.poll_interval).await {
            close_processor(&mut processor, ShutdownReason::Requested, record_checkpointer).await;
            return;
        }
    }
}
