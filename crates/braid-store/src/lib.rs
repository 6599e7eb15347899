pub mod error;
pub mod file;
pub mod memory;
pub mod records;
pub mod store;

pub use error::StoreError;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::CheckpointStore;
