pub mod event_log;
pub mod memory;

pub use event_log::{JsonlEventLog, MemoryEventLog};
pub use memory::{AlwaysReachable, MemoryAllocator, MemoryAssetStore, MemoryRecordService};
