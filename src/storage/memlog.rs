//! 有界内存日志
//!
//! - 写入时分配从 0 开始严格递增的偏移量
//! - 超过容量后淘汰最旧记录
//! - `stream()` 返回实时游标：没有新记录时挂起，直到写入或取消
//!
//! ```text
//!   earliest                      latest   next
//!      │                            │       │
//!   ┌──▼──┬─────┬─────┬─────┬─────┬─▼───┐   ▼
//!   │  5  │  6  │  7  │  8  │  9  │ 10  │ (11)
//!   └─────┴─────┴─────┴─────┴─────┴─────┘
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// 日志偏移量
pub type Offset = i64;

/// 日志记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub offset: Offset,
    pub created: DateTime<Utc>,
    pub data: Bytes,
}

/// 日志错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("Invalid capacity: {0} (must be greater than 0)")]
    InvalidCapacity(usize),

    #[error("Empty payload")]
    EmptyPayload,

    #[error("Log is closed")]
    Closed,

    #[error("Offset {offset} is no longer retained (earliest is {earliest})")]
    OutOfRange { offset: Offset, earliest: Offset },

    #[error("Offset {offset} has not been written yet (next is {next})")]
    FutureOffset { offset: Offset, next: Offset },
}

struct LogInner {
    records: VecDeque<LogRecord>,
    next_offset: Offset,
}

/// 有界内存日志
pub struct MemLog {
    capacity: usize,
    inner: RwLock<LogInner>,
    notifier: Notify,
    ct: CancellationToken,
}

impl MemLog {
    /// 创建日志；`ct` 取消后日志关闭，所有游标结束
    pub fn new(capacity: usize, ct: CancellationToken) -> Result<Self, LogError> {
        if capacity == 0 {
            return Err(LogError::InvalidCapacity(capacity));
        }

        Ok(Self {
            capacity,
            inner: RwLock::new(LogInner {
                records: VecDeque::with_capacity(capacity.min(1 << 16)),
                next_offset: 0,
            }),
            notifier: Notify::new(),
            ct,
        })
    }

    /// 追加一条记录，返回分配的偏移量
    pub fn write(&self, data: impl Into<Bytes>) -> Result<Offset, LogError> {
        if self.ct.is_cancelled() {
            return Err(LogError::Closed);
        }

        let data = data.into();
        if data.is_empty() {
            return Err(LogError::EmptyPayload);
        }

        let offset = {
            let mut inner = self.inner.write();
            let offset = inner.next_offset;
            inner.records.push_back(LogRecord {
                offset,
                created: Utc::now(),
                data,
            });
            if inner.records.len() > self.capacity {
                inner.records.pop_front();
            }
            inner.next_offset += 1;
            offset
        };

        self.notifier.notify_waiters();
        Ok(offset)
    }

    /// 读取指定偏移量
    pub fn read(&self, offset: Offset) -> Result<LogRecord, LogError> {
        let inner = self.inner.read();

        if offset >= inner.next_offset {
            return Err(LogError::FutureOffset {
                offset,
                next: inner.next_offset,
            });
        }

        let earliest = inner.next_offset - inner.records.len() as Offset;
        if offset < earliest {
            return Err(LogError::OutOfRange { offset, earliest });
        }

        Ok(inner.records[(offset - earliest) as usize].clone())
    }

    /// 返回 (earliest, latest)；空日志返回 (-1, -1)
    pub fn range(&self) -> (Offset, Offset) {
        let inner = self.inner.read();
        if inner.records.is_empty() {
            return (-1, -1);
        }
        let latest = inner.next_offset - 1;
        (latest - inner.records.len() as Offset + 1, latest)
    }

    /// 下一次写入将分配的偏移量
    pub fn next_offset(&self) -> Offset {
        self.inner.read().next_offset
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.ct.is_cancelled()
    }

    /// 从 `from` 开始的实时游标
    pub fn stream(self: &Arc<Self>, ct: CancellationToken, from: Offset) -> LogStream {
        LogStream {
            log: Arc::clone(self),
            ct,
            next: from.max(0),
        }
    }
}

/// 实时游标
pub struct LogStream {
    log: Arc<MemLog>,
    ct: CancellationToken,
    next: Offset,
}

impl LogStream {
    /// 下一个将返回的偏移量
    pub fn position(&self) -> Offset {
        self.next
    }

    /// 返回下一条记录
    ///
    /// 没有新记录时挂起；游标或日志被取消时返回 `None`。
    /// 读者落后于淘汰位置时跳到最旧的保留记录。
    pub async fn next(&mut self) -> Option<LogRecord> {
        loop {
            if self.ct.is_cancelled() || self.log.ct.is_cancelled() {
                return None;
            }

            // 先注册再检查，避免错过 notify_waiters
            let notified = self.log.notifier.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.log.read(self.next) {
                Ok(record) => {
                    self.next = record.offset + 1;
                    return Some(record);
                }
                Err(LogError::OutOfRange { offset, earliest }) => {
                    log::warn!(
                        "Log reader fell behind: offset {} evicted, skipping to {}",
                        offset,
                        earliest
                    );
                    self.next = earliest;
                    continue;
                }
                Err(_) => {}
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.ct.cancelled() => return None,
                _ = self.log.ct.cancelled() => return None,
            }
        }
    }
}
