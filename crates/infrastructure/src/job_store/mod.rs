//! 作业存储实现

mod base;
pub mod memory;
pub mod persistent;

pub use memory::MemoryJobStore;
pub use persistent::{PersistentJobStore, PersistentJobStoreOptions};
