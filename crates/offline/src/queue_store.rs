//! Durable queue store.
//!
//! The whole queue is kept in memory and written back to the key-value
//! substrate as a single JSON document after every mutation. The in-memory
//! copy sits behind an async mutex that stays locked across the write, so
//! persisted snapshots are produced in mutation order.

use std::sync::Arc;

use civicsync_core::QueueItemId;
use civicsync_infra::{KeyValueStore, KvError, load_json, store_json};
use tokio::sync::Mutex;

use crate::types::QueueItem;

pub const QUEUE_KEY: &str = "queue:v1";

/// Ordered, persisted collection of queue items.
#[derive(Debug)]
pub struct DurableQueueStore {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    items: Mutex<Vec<QueueItem>>,
}

impl DurableQueueStore {
    /// Load the queue persisted under [`QUEUE_KEY`].
    pub async fn open(kv: Arc<dyn KeyValueStore>) -> Result<Self, KvError> {
        Self::open_with_key(kv, QUEUE_KEY).await
    }

    pub async fn open_with_key(
        kv: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
    ) -> Result<Self, KvError> {
        let key = key.into();
        let mut items: Vec<QueueItem> = load_json(kv.as_ref(), &key).await?.unwrap_or_default();
        items.sort_by(|a, b| (a.enqueued_at, a.id).cmp(&(b.enqueued_at, b.id)));

        tracing::debug!(key = %key, items = items.len(), "queue store loaded");
        Ok(Self {
            kv,
            key,
            items: Mutex::new(items),
        })
    }

    /// Append an item. Nothing changes if it cannot be persisted.
    pub async fn insert(&self, item: QueueItem) -> Result<(), KvError> {
        let mut items = self.items.lock().await;
        items.push(item);
        if let Err(err) = self.persist(&items).await {
            items.pop();
            return Err(err);
        }
        Ok(())
    }

    /// Mutate one item in place and persist.
    ///
    /// Returns `Ok(None)` if the id is unknown. If persisting fails the
    /// in-memory change is kept (it is written with the next mutation) and
    /// the error is returned.
    pub async fn update<F, R>(&self, id: QueueItemId, f: F) -> Result<Option<R>, KvError>
    where
        F: FnOnce(&mut QueueItem) -> R,
    {
        let mut items = self.items.lock().await;
        let Some(item) = items.iter_mut().find(|i| i.id == id) else {
            return Ok(None);
        };
        let out = f(item);
        self.persist(&items).await?;
        Ok(Some(out))
    }

    /// Apply `f` to every item; returns clones of the items it changed.
    ///
    /// Persists only when something changed.
    pub async fn update_where<F>(&self, mut f: F) -> Result<Vec<QueueItem>, KvError>
    where
        F: FnMut(&mut QueueItem) -> bool,
    {
        let mut items = self.items.lock().await;
        let changed: Vec<QueueItem> = items
            .iter_mut()
            .filter_map(|item| f(item).then(|| item.clone()))
            .collect();
        if !changed.is_empty() {
            self.persist(&items).await?;
        }
        Ok(changed)
    }

    /// Drop every item matching `pred`; returns how many were removed.
    pub async fn remove_where<F>(&self, mut pred: F) -> Result<usize, KvError>
    where
        F: FnMut(&QueueItem) -> bool,
    {
        let mut items = self.items.lock().await;
        let (removed, kept): (Vec<QueueItem>, Vec<QueueItem>) =
            items.drain(..).partition(|item| pred(item));
        *items = kept;
        if removed.is_empty() {
            return Ok(0);
        }
        if let Err(err) = self.persist(&items).await {
            items.extend(removed);
            items.sort_by(|a, b| (a.enqueued_at, a.id).cmp(&(b.enqueued_at, b.id)));
            return Err(err);
        }
        Ok(removed.len())
    }

    pub async fn get(&self, id: QueueItemId) -> Option<QueueItem> {
        self.items.lock().await.iter().find(|i| i.id == id).cloned()
    }

    /// Snapshot in enqueue order.
    pub async fn list(&self) -> Vec<QueueItem> {
        self.items.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn persist(&self, items: &[QueueItem]) -> Result<(), KvError> {
        store_json(self.kv.as_ref(), &self.key, items).await
    }
}
