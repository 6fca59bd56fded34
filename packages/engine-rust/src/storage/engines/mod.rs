//! In-process reference backends.

mod memory_kv;
mod memory_objects;

pub use memory_kv::MemoryKeyValueMap;
pub use memory_objects::MemoryDataObjectMap;
