//! Read cache with freshness metadata.
//!
//! Each entry is stored under its own key (`cache:{key}`) in the key-value
//! substrate and mirrored in memory, so lookups are synchronous. Writes are
//! serialized through an async lock so the persisted copy follows the
//! in-memory order. The cache is bounded: once `capacity` is exceeded the
//! least recently *set* entry is evicted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use civicsync_core::Clock;
use civicsync_infra::{KeyValueStore, KvError, load_json, store_json};
use serde_json::Value;
use thiserror::Error;

use crate::types::CacheEntry;

const ENTRY_PREFIX: &str = "cache:";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Storage(#[from] KvError),
}

/// What to drop from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Key(String),
    /// Every key starting with any of the prefixes.
    Prefixes(Vec<String>),
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    next_seq: u64,
}

/// Keyed store of fetched read results. Knows nothing about the network.
#[derive(Debug)]
pub struct ReadCache {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    capacity: usize,
    state: Mutex<CacheState>,
    write_lock: tokio::sync::Mutex<()>,
}

impl ReadCache {
    /// Load persisted entries; unreadable ones are dropped with a warning.
    pub async fn open(
        kv: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        capacity: usize,
    ) -> Result<Self, CacheError> {
        let capacity = capacity.max(1);
        let mut state = CacheState::default();

        for storage_key in kv.keys_with_prefix(ENTRY_PREFIX).await? {
            match load_json::<CacheEntry>(kv.as_ref(), &storage_key).await {
                Ok(Some(entry)) => {
                    state.next_seq = state.next_seq.max(entry.set_seq + 1);
                    state.entries.insert(entry.key.clone(), entry);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(key = %storage_key, error = %err, "dropping unreadable cache entry");
                    kv.delete(&storage_key).await?;
                }
            }
        }

        let cache = Self {
            kv,
            clock,
            capacity,
            state: Mutex::new(state),
            write_lock: tokio::sync::Mutex::new(()),
        };
        cache.evict_over_capacity().await?;

        tracing::debug!(entries = cache.len(), capacity, "read cache opened");
        Ok(cache)
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.lock_state().entries.get(key).cloned()
    }

    /// Store `value` as fetched now.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Duration,
    ) -> Result<CacheEntry, CacheError> {
        let _write = self.write_lock.lock().await;

        let entry = {
            let mut state = self.lock_state();
            let entry = CacheEntry {
                key: key.to_string(),
                value,
                fetched_at: self.clock.now(),
                ttl,
                set_seq: state.next_seq,
            };
            state.next_seq += 1;
            state.entries.insert(key.to_string(), entry.clone());
            entry
        };

        store_json(self.kv.as_ref(), &storage_key(key), &entry).await?;
        self.evict_over_capacity().await?;

        tracing::trace!(key, ttl_ms = ttl.as_millis() as u64, "cache entry set");
        Ok(entry)
    }

    /// Drop entries; returns how many were removed.
    pub async fn invalidate(&self, what: Invalidation) -> Result<usize, CacheError> {
        let _write = self.write_lock.lock().await;

        let removed: Vec<String> = {
            let mut state = self.lock_state();
            let keys: Vec<String> = match &what {
                Invalidation::Key(key) => state
                    .entries
                    .contains_key(key)
                    .then(|| vec![key.clone()])
                    .unwrap_or_default(),
                Invalidation::Prefixes(prefixes) => state
                    .entries
                    .keys()
                    .filter(|k| prefixes.iter().any(|p| k.starts_with(p.as_str())))
                    .cloned()
                    .collect(),
            };
            for key in &keys {
                state.entries.remove(key);
            }
            keys
        };

        for key in &removed {
            self.kv.delete(&storage_key(key)).await?;
        }
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), ?what, "cache entries invalidated");
        }
        Ok(removed.len())
    }

    /// Milliseconds since `key` was fetched.
    pub fn get_age(&self, key: &str) -> Option<u64> {
        let now = self.clock.now();
        self.get(key)
            .map(|entry| u64::try_from(entry.age(now).as_millis()).unwrap_or(u64::MAX))
    }

    pub fn is_fresh(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.get(key).is_some_and(|entry| entry.is_fresh(now))
    }

    pub async fn clear(&self) -> Result<usize, CacheError> {
        let _write = self.write_lock.lock().await;
        let keys: Vec<String> = self.lock_state().entries.drain().map(|(k, _)| k).collect();
        for key in &keys {
            self.kv.delete(&storage_key(key)).await?;
        }
        Ok(keys.len())
    }

    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Callers other than `open` must hold `write_lock`.
    async fn evict_over_capacity(&self) -> Result<(), CacheError> {
        let evicted: Vec<String> = {
            let mut state = self.lock_state();
            let mut evicted = Vec::new();
            while state.entries.len() > self.capacity {
                let Some(oldest) = state
                    .entries
                    .values()
                    .min_by_key(|e| e.set_seq)
                    .map(|e| e.key.clone())
                else {
                    break;
                };
                state.entries.remove(&oldest);
                evicted.push(oldest);
            }
            evicted
        };

        for key in &evicted {
            tracing::debug!(key = %key, "evicted cache entry");
            self.kv.delete(&storage_key(key)).await?;
        }
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn storage_key(key: &str) -> String {
    format!("{ENTRY_PREFIX}{key}")
}
