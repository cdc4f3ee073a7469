//! Optimistic record reconciliation.
//!
//! A [`LocalEntity`] is created (and persisted) before its write is queued so
//! the user sees it immediately. Queue outcomes are the only input that moves
//! its `sync_state`:
//!
//! - in flight → `syncing`
//! - accepted → `synced`, `server_id` recorded
//! - transient failure, retry pending → `unsynced`
//! - permanent failure / exhausted → `sync_failed`
//! - manual retry → `unsynced`
//!
//! An entity still `syncing` when the store is reopened was interrupted with
//! its write; it goes back to `unsynced`, as its queue item goes back to
//! `pending`.
//!
//! Entities leave the store only through [`LocalEntityReconciler::remove`]
//! (user action) or [`LocalEntityReconciler::merge_confirmed`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use civicsync_core::{Clock, LocalId, ServerId};
use civicsync_events::{EventBus, InMemoryEventBus, Subscription, SubscriptionId};
use civicsync_infra::{KeyValueStore, KvError, load_json, store_json};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::queue::OutcomeHandler;
use crate::types::{LocalEntity, QueueOutcome, SyncState};

pub const ENTITIES_KEY: &str = "entities:v1";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("entity storage error: {0}")]
    Storage(#[from] KvError),

    #[error("unknown local entity {0}")]
    NotFound(LocalId),

    #[error("local entity {0} is not synced yet")]
    NotSynced(LocalId),
}

/// Owner of the local-id ↔ server-id mapping.
#[derive(Debug)]
pub struct LocalEntityReconciler {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    entities: Mutex<BTreeMap<LocalId, LocalEntity>>,
    changes: InMemoryEventBus<LocalEntity>,
}

impl LocalEntityReconciler {
    pub async fn open(
        kv: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ReconcileError> {
        let entities: BTreeMap<LocalId, LocalEntity> = load_json::<Vec<LocalEntity>>(kv.as_ref(), ENTITIES_KEY)
            .await?
            .unwrap_or_default()
            .into_iter()
            .map(|e| (e.local_id, e))
            .collect();

        tracing::debug!(entities = entities.len(), "local entity store loaded");
        let reconciler = Self {
            kv,
            clock,
            entities: Mutex::new(entities),
            changes: InMemoryEventBus::new(),
        };
        reconciler.reset_interrupted().await?;
        Ok(reconciler)
    }

    async fn reset_interrupted(&self) -> Result<usize, ReconcileError> {
        let mut entities = self.entities.lock().await;
        let now = self.clock.now();
        let mut reset = 0;
        for entity in entities
            .values_mut()
            .filter(|e| e.sync_state == SyncState::Syncing)
        {
            entity.sync_state = SyncState::Unsynced;
            entity.updated_at = now;
            reset += 1;
        }
        if reset > 0 {
            self.persist(&entities).await?;
            tracing::warn!(entities = reset, "reset entities interrupted mid-sync");
        }
        Ok(reset)
    }

    /// Insert a new `unsynced` record with a fresh local id.
    pub async fn create_optimistic(&self, payload: Value) -> Result<LocalEntity, ReconcileError> {
        let mut entities = self.entities.lock().await;

        let mut local_id = LocalId::new();
        while entities.contains_key(&local_id) {
            local_id = LocalId::new();
        }

        let now = self.clock.now();
        let entity = LocalEntity {
            local_id,
            server_id: None,
            sync_state: SyncState::Unsynced,
            payload,
            created_at: now,
            updated_at: now,
            last_error: None,
        };
        entities.insert(local_id, entity.clone());

        if let Err(err) = self.persist(&entities).await {
            entities.remove(&local_id);
            return Err(err.into());
        }

        tracing::info!(local_id = %local_id, "optimistic entity created");
        self.publish(entity.clone());
        Ok(entity)
    }

    /// Apply a queue outcome. Returns the updated entity, or `None` when the
    /// id is unknown (e.g. removed by the user while the write was queued).
    pub async fn on_queue_outcome(
        &self,
        local_id: LocalId,
        outcome: QueueOutcome,
    ) -> Result<Option<LocalEntity>, ReconcileError> {
        let mut entities = self.entities.lock().await;
        let Some(entity) = entities.get_mut(&local_id) else {
            tracing::warn!(local_id = %local_id, ?outcome, "outcome for unknown local entity");
            return Ok(None);
        };

        let before = entity.clone();
        apply_outcome(entity, outcome);
        if *entity == before {
            return Ok(Some(before));
        }
        entity.updated_at = self.clock.now();
        let updated = entity.clone();

        self.persist(&entities).await?;
        tracing::debug!(
            local_id = %local_id,
            from = before.sync_state.as_str(),
            to = updated.sync_state.as_str(),
            "entity sync state changed"
        );
        self.publish(updated.clone());
        Ok(Some(updated))
    }

    pub async fn get(&self, local_id: LocalId) -> Option<LocalEntity> {
        self.entities.lock().await.get(&local_id).cloned()
    }

    /// All entities, oldest first.
    pub async fn list(&self) -> Vec<LocalEntity> {
        let mut all: Vec<LocalEntity> = self.entities.lock().await.values().cloned().collect();
        all.sort_by_key(|e| (e.created_at, e.local_id));
        all
    }

    pub async fn find_by_server_id(&self, server_id: &ServerId) -> Option<LocalEntity> {
        self.entities
            .lock()
            .await
            .values()
            .find(|e| e.server_id.as_ref() == Some(server_id))
            .cloned()
    }

    /// Delete a record on explicit user request.
    pub async fn remove(&self, local_id: LocalId) -> Result<bool, ReconcileError> {
        let mut entities = self.entities.lock().await;
        let Some(removed) = entities.remove(&local_id) else {
            return Ok(false);
        };
        if let Err(err) = self.persist(&entities).await {
            entities.insert(local_id, removed);
            return Err(err.into());
        }
        tracing::info!(local_id = %local_id, "local entity removed");
        Ok(true)
    }

    /// Drop a `synced` record once the authoritative server copy replaced it.
    pub async fn merge_confirmed(&self, local_id: LocalId) -> Result<LocalEntity, ReconcileError> {
        let mut entities = self.entities.lock().await;
        match entities.get(&local_id) {
            None => return Err(ReconcileError::NotFound(local_id)),
            Some(e) if e.sync_state != SyncState::Synced => {
                return Err(ReconcileError::NotSynced(local_id));
            }
            Some(_) => {}
        }

        let Some(merged) = entities.remove(&local_id) else {
            return Err(ReconcileError::NotFound(local_id));
        };
        if let Err(err) = self.persist(&entities).await {
            entities.insert(local_id, merged);
            return Err(err.into());
        }
        tracing::debug!(local_id = %local_id, server_id = ?merged.server_id, "entity merged into server record");
        Ok(merged)
    }

    pub fn subscribe(&self) -> Subscription<LocalEntity> {
        self.changes.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.changes.unsubscribe(id)
    }

    async fn persist(&self, entities: &BTreeMap<LocalId, LocalEntity>) -> Result<(), KvError> {
        let all: Vec<&LocalEntity> = entities.values().collect();
        store_json(self.kv.as_ref(), ENTITIES_KEY, &all).await
    }

    fn publish(&self, entity: LocalEntity) {
        if let Err(err) = self.changes.publish(entity) {
            tracing::error!(error = %err, "failed to publish entity change");
        }
    }
}

fn apply_outcome(entity: &mut LocalEntity, outcome: QueueOutcome) {
    // A confirmed record never goes back.
    if entity.sync_state == SyncState::Synced {
        return;
    }

    match outcome {
        QueueOutcome::InFlight => entity.sync_state = SyncState::Syncing,
        QueueOutcome::Succeeded { server_id } => {
            entity.sync_state = SyncState::Synced;
            entity.server_id = Some(server_id);
            entity.last_error = None;
        }
        QueueOutcome::Retrying { error, .. } => {
            entity.sync_state = SyncState::Unsynced;
            entity.last_error = Some(error);
        }
        QueueOutcome::Failed { error, .. } => {
            entity.sync_state = SyncState::SyncFailed;
            entity.last_error = Some(error);
        }
        QueueOutcome::Requeued => {
            entity.sync_state = SyncState::Unsynced;
            entity.last_error = None;
        }
    }
}

#[async_trait]
impl OutcomeHandler for LocalEntityReconciler {
    async fn on_queue_outcome(&self, local_id: LocalId, outcome: QueueOutcome) {
        if let Err(err) = LocalEntityReconciler::on_queue_outcome(self, local_id, outcome).await {
            tracing::error!(local_id = %local_id, error = %err, "failed to record queue outcome");
        }
    }
}
