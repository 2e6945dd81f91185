//! 索引模块
//!
//! 设计理念：
//! - 每个路由一个时间戳索引，和该路由的日志共享偏移量空间
//! - 写入方（ingest）与查找方（HTTP 流）通过读写锁隔离
//!
//! 索引类型：
//! - TimestampIndex: 时间戳 → 日志偏移（用于按时间回放）

pub mod timestamp;

pub use timestamp::{IndexError, SharedTimestampIndex, TimestampIndex};
