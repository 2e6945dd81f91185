//! 检查点存储
//!
//! 进程内、非持久化的检查点/租约存储，满足消费子系统的
//! [`Checkpointer`](crate::consumer::Checkpointer) 接口。

pub mod memory;
pub mod types;

pub use memory::InMemoryCheckpointer;
pub use types::CheckpointRecord;
