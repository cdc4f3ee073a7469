use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::r#trait::{KeyValueStore, KvError};

/// In-memory key-value store.
///
/// Intended for tests/dev. Cloning the `Arc` that wraps it and re-opening a
/// component on the same store simulates a process restart.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| KvError::storage("in-memory store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| KvError::storage("in-memory store lock poisoned"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| KvError::storage("in-memory store lock poisoned"))?;
        Ok(entries.remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| KvError::storage("in-memory store lock poisoned"))?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{load_json, store_json};

    #[tokio::test]
    async fn set_get_delete() {
        let store = InMemoryKvStore::new();
        assert_eq!(store.get("a").await.unwrap(), None);

        store.set("a", "1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn prefix_listing_is_ordered_and_exclusive() {
        let store = InMemoryKvStore::new();
        for k in ["cache:b", "cache:a", "queue:items", "cachex"] {
            store.set(k, "{}").await.unwrap();
        }

        let keys = store.keys_with_prefix("cache:").await.unwrap();
        assert_eq!(keys, vec!["cache:a".to_string(), "cache:b".to_string()]);
    }

    #[tokio::test]
    async fn json_helpers_round_trip_and_report_bad_data() {
        let store = InMemoryKvStore::new();
        store_json(&store, "nums", &vec![1, 2, 3]).await.unwrap();
        let nums: Option<Vec<u32>> = load_json(&store, "nums").await.unwrap();
        assert_eq!(nums, Some(vec![1, 2, 3]));

        store.set("broken", "{not json").await.unwrap();
        let err = load_json::<Vec<u32>>(&store, "broken").await.unwrap_err();
        assert!(matches!(err, KvError::Serialization { ref key, .. } if key == "broken"));
    }
}
