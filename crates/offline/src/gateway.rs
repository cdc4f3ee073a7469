//! Offline-first read gateway.
//!
//! Serves reads from the [`ReadCache`] first and decides whether (and how) to
//! go to the network:
//!
//! | cache        | conditions                     | result                                  |
//! |--------------|--------------------------------|-----------------------------------------|
//! | fresh        |                                | cached value, no fetch                  |
//! | stale        | offline or `offline_only`      | stale value, no fetch                   |
//! | stale        | `stale_while_revalidate`       | stale value, refresh in the background  |
//! | stale        | otherwise                      | fetched value; stale value if it fails  |
//! | missing      | `offline_only`                 | `None`, no fetch                        |
//! | missing      | otherwise                      | fetched value; error if it fails        |
//!
//! Background refresh failures are logged and published, never returned.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use civicsync_events::{EventBus, InMemoryEventBus, Subscription, SubscriptionId};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::cache::{CacheError, ReadCache};
use crate::connectivity::ConnectivityMonitor;

pub const DEFAULT_READ_TTL: Duration = Duration::from_secs(5 * 60);

/// Boxed future produced by a reusable fetcher.
pub type FetchFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + 'static>>;

/// Fetcher that can be invoked repeatedly (priority revalidation).
pub type SharedFetcher = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// Wrap an async closure as a [`SharedFetcher`].
pub fn shared_fetcher<F, Fut>(f: F) -> SharedFetcher
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as FetchFuture)
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Nothing cached and the fetch failed.
    #[error("fetch failed for '{key}': {source}")]
    Fetch {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cached value for '{key}' has an unexpected shape: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    pub ttl: Duration,
    pub stale_while_revalidate: bool,
    /// Never touch the network.
    pub offline_only: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_READ_TTL,
            stale_while_revalidate: true,
            offline_only: false,
        }
    }
}

impl ReadOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }
}

/// Where a returned value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Fresh cache hit.
    Cache,
    /// Stale cache hit.
    Stale,
    /// Fetched during this call.
    Network,
    /// The fetch failed; the stale value was returned instead.
    StaleFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome {
    pub value: Value,
    pub source: ReadSource,
    pub fetched_at: DateTime<Utc>,
    /// A background refresh was started by this call.
    pub refreshing: bool,
}

/// Notifications for read subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Refreshed {
        key: String,
        value: Value,
        fetched_at: DateTime<Utc>,
    },
    RefreshFailed {
        key: String,
        error: String,
    },
}

/// Counters for one priority revalidation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevalidationSummary {
    pub refreshed: usize,
    pub failed: usize,
    /// Fresh, already refreshing, or offline.
    pub skipped: usize,
}

struct PriorityRead {
    key: String,
    ttl: Duration,
    fetcher: SharedFetcher,
}

struct GatewayInner {
    cache: Arc<ReadCache>,
    connectivity: Arc<ConnectivityMonitor>,
    events: InMemoryEventBus<CacheEvent>,
    in_flight: Mutex<HashSet<String>>,
    priority: Mutex<Vec<PriorityRead>>,
}

/// Releases a key's refresh slot when dropped.
struct RefreshClaim<'a> {
    inner: &'a GatewayInner,
    key: &'a str,
}

impl Drop for RefreshClaim<'_> {
    fn drop(&mut self) {
        lock(&self.inner.in_flight).remove(self.key);
    }
}

/// Cache-first reader. Cheap to clone.
#[derive(Clone)]
pub struct OfflineFirstGateway {
    inner: Arc<GatewayInner>,
}

impl core::fmt::Debug for OfflineFirstGateway {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OfflineFirstGateway")
            .field("priority_keys", &self.priority_keys())
            .finish_non_exhaustive()
    }
}

impl OfflineFirstGateway {
    pub fn new(cache: Arc<ReadCache>, connectivity: Arc<ConnectivityMonitor>) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                cache,
                connectivity,
                events: InMemoryEventBus::new(),
                in_flight: Mutex::new(HashSet::new()),
                priority: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<ReadCache> {
        &self.inner.cache
    }

    /// Read `key`, consulting the cache first.
    ///
    /// Returns `Ok(None)` only for an `offline_only` read of a missing key.
    pub async fn read<F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        options: ReadOptions,
    ) -> Result<Option<ReadOutcome>, GatewayError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let cache = &self.inner.cache;
        let online = self.inner.connectivity.is_online();

        let Some(entry) = cache.get(key) else {
            if options.offline_only {
                tracing::debug!(key, "cache miss on offline-only read");
                return Ok(None);
            }
            tracing::debug!(key, online, "cache miss; fetching");
            let value = fetcher().await.map_err(|source| GatewayError::Fetch {
                key: key.to_string(),
                source,
            })?;
            let fetched_at = self.store(key, value.clone(), options.ttl).await;
            return Ok(Some(ReadOutcome {
                value,
                source: ReadSource::Network,
                fetched_at,
                refreshing: false,
            }));
        };

        if entry.is_fresh(cache.now()) {
            return Ok(Some(ReadOutcome {
                value: entry.value,
                source: ReadSource::Cache,
                fetched_at: entry.fetched_at,
                refreshing: false,
            }));
        }

        if options.offline_only || !online {
            tracing::debug!(key, online, "serving stale entry without refresh");
            return Ok(Some(ReadOutcome {
                value: entry.value,
                source: ReadSource::Stale,
                fetched_at: entry.fetched_at,
                refreshing: false,
            }));
        }

        if options.stale_while_revalidate {
            let refreshing = self.spawn_refresh(key, fetcher, options.ttl);
            return Ok(Some(ReadOutcome {
                value: entry.value,
                source: ReadSource::Stale,
                fetched_at: entry.fetched_at,
                refreshing,
            }));
        }

        match fetcher().await {
            Ok(value) => {
                let fetched_at = self.store(key, value.clone(), options.ttl).await;
                Ok(Some(ReadOutcome {
                    value,
                    source: ReadSource::Network,
                    fetched_at,
                    refreshing: false,
                }))
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "fetch failed; serving stale entry");
                Ok(Some(ReadOutcome {
                    value: entry.value,
                    source: ReadSource::StaleFallback,
                    fetched_at: entry.fetched_at,
                    refreshing: false,
                }))
            }
        }
    }

    /// [`read`](Self::read) and deserialize the value.
    pub async fn read_as<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        options: ReadOptions,
    ) -> Result<Option<(T, ReadSource)>, GatewayError>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let Some(outcome) = self.read(key, fetcher, options).await? else {
            return Ok(None);
        };
        let value = serde_json::from_value(outcome.value).map_err(|source| GatewayError::Decode {
            key: key.to_string(),
            source,
        })?;
        Ok(Some((value, outcome.source)))
    }

    /// Keep `key` warm: the orchestrator revalidates it on every sync pass.
    pub fn register_priority(&self, key: impl Into<String>, ttl: Duration, fetcher: SharedFetcher) {
        let key = key.into();
        let mut priority = lock(&self.inner.priority);
        priority.retain(|p| p.key != key);
        tracing::debug!(key = %key, "priority read registered");
        priority.push(PriorityRead { key, ttl, fetcher });
    }

    pub fn unregister_priority(&self, key: &str) -> bool {
        let mut priority = lock(&self.inner.priority);
        let before = priority.len();
        priority.retain(|p| p.key != key);
        priority.len() != before
    }

    pub fn priority_keys(&self) -> Vec<String> {
        lock(&self.inner.priority)
            .iter()
            .map(|p| p.key.clone())
            .collect()
    }

    /// Refetch every priority key that is stale or missing, one at a time.
    pub async fn revalidate_priority(&self) -> RevalidationSummary {
        let targets: Vec<(String, Duration, SharedFetcher)> = lock(&self.inner.priority)
            .iter()
            .map(|p| (p.key.clone(), p.ttl, p.fetcher.clone()))
            .collect();

        let mut summary = RevalidationSummary::default();
        if !self.inner.connectivity.is_online() {
            summary.skipped = targets.len();
            return summary;
        }

        for (key, ttl, fetcher) in targets {
            if self.inner.cache.is_fresh(&key) || !self.claim_refresh(&key) {
                summary.skipped += 1;
                continue;
            }
            let _claim = RefreshClaim {
                inner: &self.inner,
                key: &key,
            };
            if self.refresh(&key, fetcher(), ttl).await {
                summary.refreshed += 1;
            } else {
                summary.failed += 1;
            }
        }

        if summary.refreshed + summary.failed > 0 {
            tracing::info!(
                refreshed = summary.refreshed,
                failed = summary.failed,
                skipped = summary.skipped,
                "priority reads revalidated"
            );
        }
        summary
    }

    pub fn subscribe(&self) -> Subscription<CacheEvent> {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Start a background refresh unless one is already running for `key`.
    fn spawn_refresh<F, Fut>(&self, key: &str, fetcher: F, ttl: Duration) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if !self.claim_refresh(key) {
            tracing::trace!(key, "refresh already in flight");
            return false;
        }

        let gateway = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let _claim = RefreshClaim {
                inner: &gateway.inner,
                key: &key,
            };
            gateway.refresh(&key, fetcher(), ttl).await;
        });
        true
    }

    fn claim_refresh(&self, key: &str) -> bool {
        lock(&self.inner.in_flight).insert(key.to_string())
    }

    async fn refresh<Fut>(&self, key: &str, fetch: Fut, ttl: Duration) -> bool
    where
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let result = match fetch.await {
            Ok(value) => self
                .inner
                .cache
                .set(key, value, ttl)
                .await
                .map_err(anyhow::Error::from),
            Err(err) => Err(err),
        };

        let event = match result {
            Ok(entry) => {
                tracing::debug!(key, "cache entry refreshed");
                CacheEvent::Refreshed {
                    key: key.to_string(),
                    value: entry.value,
                    fetched_at: entry.fetched_at,
                }
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "cache refresh failed");
                CacheEvent::RefreshFailed {
                    key: key.to_string(),
                    error: err.to_string(),
                }
            }
        };
        let refreshed = matches!(event, CacheEvent::Refreshed { .. });
        if let Err(err) = self.inner.events.publish(event) {
            tracing::error!(error = %err, "failed to publish cache event");
        }
        refreshed
    }

    /// Cache a fetched value; a storage failure does not fail the read.
    async fn store(&self, key: &str, value: Value, ttl: Duration) -> DateTime<Utc> {
        match self.inner.cache.set(key, value, ttl).await {
            Ok(entry) => entry.fetched_at,
            Err(err) => {
                tracing::warn!(key, error = %err, "failed to cache fetched value");
                self.inner.cache.now()
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
