use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors raised by a key-value store.
#[derive(Debug, Error)]
pub enum KvError {
    /// The underlying medium failed (disk, database, lock).
    #[error("storage error: {0}")]
    Storage(String),

    /// A stored value could not be (de)serialized.
    #[error("serialization error for key '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl KvError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

impl From<sqlx::Error> for KvError {
    fn from(value: sqlx::Error) -> Self {
        KvError::Storage(value.to_string())
    }
}

/// Persistent key-value substrate.
///
/// ## Contract
///
/// - `set` overwrites; a successful return means the value is durable for
///   that implementation (in-memory stores are durable for the process
///   lifetime only).
/// - `delete` reports whether a value existed.
/// - `keys_with_prefix` returns matching keys in lexicographic order.
///
/// Values are strings; callers store JSON through `store_json`/`load_json`.
#[async_trait]
pub trait KeyValueStore: Send + Sync + core::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}

/// Load and deserialize a JSON value.
pub async fn load_json<T>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>, KvError>
where
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| KvError::Serialization {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// Serialize a value as JSON and store it.
pub async fn store_json<T>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<(), KvError>
where
    T: Serialize + ?Sized,
{
    let raw = serde_json::to_string(value).map_err(|source| KvError::Serialization {
        key: key.to_string(),
        source,
    })?;
    store.set(key, &raw).await
}
