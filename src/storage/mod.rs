//! 内存存储模块

// 有界内存日志
pub mod memlog;

// 时间戳索引
pub mod index;

// Checkpoint 模块（消费进度/租约）
pub mod checkpoint;

pub use memlog::{LogError, LogRecord, LogStream, MemLog, Offset};
