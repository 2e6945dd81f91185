//! 按行读取的记录源
//!
//! 把文件（或 stdin）中的每一行当作一条记录放进单分区的
//! [`MemorySource`]。`follow` 模式下到达文件末尾后继续轮询新数据，
//! 类似 `tail -f`；否则读到末尾即关闭分区。
//!
//! `LATEST` 固定为 `start()` 时的位置，即启动后读入的所有行。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use super::source::{
    MemorySource, PartitionInfo, ReadBatch, RecordSource, SourceError, StartingPoint,
};
use super::InitialPosition;

/// 唯一分区的 ID
pub const LINES_PARTITION: &str = "lines-0";

/// 表示标准输入的路径
pub const STDIN_PATH: &str = "-";

const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(200);

type LineReader = Box<dyn AsyncBufRead + Unpin + Send>;

pub struct LinesSource {
    path: PathBuf,
    follow: bool,
    buffer: Arc<MemorySource>,
    started: AtomicBool,
    /// `start()` 时的 LATEST 迭代器
    latest_at_start: Mutex<Option<String>>,
}

impl LinesSource {
    pub fn new(path: impl Into<PathBuf>, follow: bool) -> Self {
        Self {
            path: path.into(),
            follow,
            buffer: MemorySource::single(LINES_PARTITION),
            started: AtomicBool::new(false),
            latest_at_start: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn follow(&self) -> bool {
        self.follow
    }

    fn is_stdin(&self) -> bool {
        self.path.as_os_str() == STDIN_PATH
    }

    async fn open(&self) -> Result<LineReader, SourceError> {
        if self.is_stdin() {
            return Ok(Box::new(BufReader::new(tokio::io::stdin())));
        }
        let file = File::open(&self.path).await?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// 逐行读取直到 EOF（非 follow）或取消
async fn pump_lines(
    mut reader: LineReader,
    follow: bool,
    buffer: Arc<MemorySource>,
    ct: CancellationToken,
    source_name: String,
) {
    let mut line = String::new();

    loop {
        let read = tokio::select! {
            _ = ct.cancelled() => break,
            read = reader.read_line(&mut line) => read,
        };

        match read {
            Ok(0) => {
                if !follow {
                    break;
                }
                tokio::select! {
                    _ = ct.cancelled() => break,
                    _ = tokio::time::sleep(FOLLOW_POLL_INTERVAL) => {}
                }
            }
            Ok(_) => {
                // follow 模式下不完整的最后一行留到下次补齐
                if follow && !line.ends_with('\n') {
                    continue;
                }

                let trimmed = line.trim_end_matches(&['\n', '\r'][..]);
                if !trimmed.trim().is_empty() {
                    if let Err(e) = buffer.put(LINES_PARTITION, trimmed.to_string()) {
                        log::warn!("[lines {}] dropping line: {}", source_name, e);
                    }
                }
                line.clear();
            }
            Err(e) => {
                log::error!("[lines {}] read failed: {}", source_name, e);
                break;
            }
        }
    }

    // 非 follow 模式下残留的最后一行（无换行结尾）
    let trimmed = line.trim_end_matches(&['\n', '\r'][..]);
    if !trimmed.trim().is_empty() && !ct.is_cancelled() {
        if let Err(e) = buffer.put(LINES_PARTITION, trimmed.to_string()) {
            log::warn!("[lines {}] dropping line: {}", source_name, e);
        }
    }

    if let Err(e) = buffer.close_partition(LINES_PARTITION) {
        log::warn!("[lines {}] close failed: {}", source_name, e);
    }
    log::info!("[lines {}] input finished", source_name);
}

#[async_trait]
impl RecordSource for LinesSource {
    async fn start(&self, ct: CancellationToken) -> Result<(), SourceError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let reader = match self.open().await {
            Ok(reader) => reader,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let latest = self
            .buffer
            .iterator(LINES_PARTITION, &StartingPoint::Initial(InitialPosition::Latest))
            .await?;
        *self.latest_at_start.lock() = Some(latest);

        let source_name = self.path.display().to_string();
        log::info!(
            "[lines {}] reading (follow={})",
            source_name,
            self.follow
        );

        tokio::spawn(pump_lines(
            reader,
            self.follow,
            Arc::clone(&self.buffer),
            ct,
            source_name,
        ));

        Ok(())
    }

    async fn list_partitions(&self) -> Result<Vec<PartitionInfo>, SourceError> {
        self.buffer.list_partitions().await
    }

    async fn iterator(
        &self,
        partition_id: &str,
        start: &StartingPoint,
    ) -> Result<String, SourceError> {
        if let StartingPoint::Initial(InitialPosition::Latest) = start {
            if let Some(latest) = self.latest_at_start.lock().clone() {
                return Ok(latest);
            }
        }
        self.buffer.iterator(partition_id, start).await
    }

    async fn read(
        &self,
        partition_id: &str,
        iterator: &str,
        limit: usize,
    ) -> Result<ReadBatch, SourceError> {
        self.buffer.read(partition_id, iterator, limit).await
    }
}
