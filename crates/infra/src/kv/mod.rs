//! Key-value storage boundary.
//!
//! This module defines a storage-facing abstraction without making any
//! assumptions about the medium, plus two implementations:
//! - `InMemoryKvStore` for tests/dev
//! - `SqliteKvStore` for on-device persistence

pub mod in_memory;
pub mod sqlite;
pub mod r#trait;

pub use in_memory::InMemoryKvStore;
pub use sqlite::SqliteKvStore;
pub use r#trait::{KeyValueStore, KvError, load_json, store_json};
