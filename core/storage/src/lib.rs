//! Durable key-value storage for fieldsync.
//!
//! The sync engine persists its queue, statistics and id mappings as string
//! blobs under well-known keys. This crate provides the store abstraction and
//! two backends:
//! - `MemoryStore`: process-local, for tests and ephemeral sessions
//! - `FileStore`: one file per key with atomic replace

pub mod local;
pub mod memory;
pub mod store;

pub use local::FileStore;
pub use memory::MemoryStore;
pub use store::KeyValueStore;
