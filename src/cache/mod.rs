//! Normalized caching primitives.
//!
//! This module provides the pieces the resource records are built from:
//! - Deterministic cache keys from path templates and id collections
//! - A flat store of entities keyed by (resource type, id)
//! - Pluggable key-value backends (in-memory, no-op, SQLite)

pub mod atomic;
pub mod key;
pub mod storage;

pub use atomic::{AtomicEntry, AtomicStore};
pub use key::{DataDescriptor, ResourceId, ResourcePointer, Variables};
pub use storage::{KeyValueStore, MemoryStore, NoopStore, SqliteStore};
