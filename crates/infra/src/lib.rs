//! Infrastructure layer: the persistent key-value substrate.
//!
//! The durable queue, the read cache and the reconciler all persist through
//! `KeyValueStore`, so any on-device storage that offers get/set/delete by
//! key can back the engine.

pub mod kv;

pub use kv::{InMemoryKvStore, KeyValueStore, KvError, SqliteKvStore, load_json, store_json};
