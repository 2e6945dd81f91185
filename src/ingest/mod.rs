//! 摄入管道
//!
//! ```text
//! 上游批次 ──► envelope::decode ──► MemLog::write ──► TimestampIndex::add
//!                  │ 失败                 │ 失败
//!                  └──── 跳过并计数 ◄──────┘
//! ```
//!
//! 解码或写入失败的记录被跳过，不影响同批次的其它记录。

pub mod envelope;
pub mod processor;

pub use envelope::{decode, Envelope, SkipReason};
pub use processor::{RouteProcessorFactory, RouteRecordProcessor};
