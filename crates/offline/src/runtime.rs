//! Engine wiring.
//!
//! Every component is a long-lived object created once here and shared by
//! handle; nothing in the engine is a process-wide global.

use std::sync::Arc;
use std::time::Duration;

use civicsync_core::{Clock, SystemClock};
use civicsync_infra::{KeyValueStore, KvError, SqliteKvStore};
use serde_json::Value;
use thiserror::Error;

use crate::backoff::RetryPolicy;
use crate::cache::{CacheError, ReadCache};
use crate::config::{ConfigError, EngineConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::gateway::OfflineFirstGateway;
use crate::http::{HttpHealthProbe, HttpReadClient, HttpRemoteWriter};
use crate::orchestrator::SyncOrchestrator;
use crate::queue::{QueueError, QueueSettings, SubmissionQueue};
use crate::reconciler::{LocalEntityReconciler, ReconcileError};
use crate::remote::{RemoteError, RemoteWriter};
use crate::types::{LocalEntity, OperationType, QueueItem};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] KvError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("http client setup failed: {0}")]
    Http(#[source] anyhow::Error),
}

/// Handles to every engine component, shared across the host application.
#[derive(Debug, Clone)]
pub struct OfflineRuntime {
    pub connectivity: Arc<ConnectivityMonitor>,
    pub queue: SubmissionQueue,
    pub cache: Arc<ReadCache>,
    pub gateway: OfflineFirstGateway,
    pub reconciler: Arc<LocalEntityReconciler>,
    pub orchestrator: Arc<SyncOrchestrator>,
    reads: Option<HttpReadClient>,
}

impl OfflineRuntime {
    /// Open the engine on SQLite with the HTTP adapters.
    pub async fn open(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let kv: Arc<dyn KeyValueStore> = Arc::new(SqliteKvStore::open(&config.db_path()).await?);

        let mut writer = HttpRemoteWriter::new(&config.api_url, config.request_timeout)?;
        let mut reads =
            HttpReadClient::new(&config.api_url, config.request_timeout).map_err(RuntimeError::Http)?;
        if let Some(token) = &config.auth_token {
            writer = writer.with_token(token);
            reads = reads.with_token(token);
        }

        let probe = HttpHealthProbe::new(&config.api_url, config.request_timeout)
            .map_err(RuntimeError::Http)?;
        let connectivity = Arc::new(ConnectivityMonitor::start(Arc::new(probe)).await);

        let mut runtime =
            Self::with_parts(config, kv, Arc::new(writer), connectivity, Arc::new(SystemClock)).await?;
        runtime.reads = Some(reads);

        tracing::info!(
            api_url = %config.api_url,
            db = %config.db_path().display(),
            "offline runtime opened"
        );
        Ok(runtime)
    }

    /// Wire the engine over caller-supplied substrate and adapters.
    pub async fn with_parts(
        config: &EngineConfig,
        kv: Arc<dyn KeyValueStore>,
        writer: Arc<dyn RemoteWriter>,
        connectivity: Arc<ConnectivityMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RuntimeError> {
        let reconciler = Arc::new(LocalEntityReconciler::open(kv.clone(), clock.clone()).await?);

        let settings = QueueSettings {
            retry: RetryPolicy::with_max_retries(config.max_retries),
            request_timeout: config.request_timeout,
            clock: clock.clone(),
        };
        let queue = SubmissionQueue::open(kv.clone(), writer, connectivity.clone(), settings).await?;
        queue.set_outcome_handler(reconciler.clone());

        let cache = Arc::new(ReadCache::open(kv, clock, config.cache_capacity).await?);
        let gateway = OfflineFirstGateway::new(cache.clone(), connectivity.clone());

        let orchestrator = Arc::new(SyncOrchestrator::new(
            queue.clone(),
            gateway.clone(),
            connectivity.clone(),
            config.orchestrator_settings(),
        ));

        Ok(Self {
            connectivity,
            queue,
            cache,
            gateway,
            reconciler,
            orchestrator,
            reads: None,
        })
    }

    /// Create the optimistic record for a report and queue its write.
    ///
    /// If the write cannot be queued the record is removed again.
    pub async fn submit_report(&self, payload: Value) -> Result<(LocalEntity, QueueItem), RuntimeError> {
        let entity = self.reconciler.create_optimistic(payload.clone()).await?;
        let queued = self
            .queue
            .enqueue_for(OperationType::SubmitReport, payload, Some(entity.local_id))
            .await;
        match queued {
            Ok(item) => Ok((entity, item)),
            Err(err) => {
                tracing::warn!(local_id = %entity.local_id, error = %err, "enqueue failed; dropping optimistic entity");
                if let Err(cleanup) = self.reconciler.remove(entity.local_id).await {
                    tracing::error!(
                        local_id = %entity.local_id,
                        error = %cleanup,
                        "failed to drop optimistic entity"
                    );
                }
                Err(err.into())
            }
        }
    }

    /// Keep `key` warm from `GET {api_url}/{path}` on every sync pass.
    ///
    /// Returns `false` when the runtime has no HTTP read client
    /// (see [`with_parts`](Self::with_parts)).
    pub fn watch_path(&self, key: impl Into<String>, path: impl Into<String>, ttl: Duration) -> bool {
        let Some(reads) = &self.reads else {
            return false;
        };
        self.gateway.register_priority(key, ttl, reads.fetcher(path));
        true
    }

    pub fn read_client(&self) -> Option<&HttpReadClient> {
        self.reads.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedWriter;
    use crate::types::{ConnectivityStatus, QueueStatus, SyncState};
    use async_trait::async_trait;
    use civicsync_core::ManualClock;
    use civicsync_infra::InMemoryKvStore;
    use serde_json::json;

    /// Store whose queue document can never be written.
    #[derive(Debug, Default)]
    struct QueueWritesFail(InMemoryKvStore);

    #[async_trait]
    impl KeyValueStore for QueueWritesFail {
        async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
            if key.starts_with("queue:") {
                return Err(KvError::storage("disk full"));
            }
            self.0.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<bool, KvError> {
            self.0.delete(key).await
        }

        async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
            self.0.keys_with_prefix(prefix).await
        }
    }

    async fn runtime(online: bool, writer: Arc<ScriptedWriter>) -> OfflineRuntime {
        runtime_on(Arc::new(InMemoryKvStore::new()), online, writer).await
    }

    async fn runtime_on(
        kv: Arc<dyn KeyValueStore>,
        online: bool,
        writer: Arc<ScriptedWriter>,
    ) -> OfflineRuntime {
        let status = if online {
            ConnectivityStatus::online(crate::types::NetworkType::Wifi)
        } else {
            ConnectivityStatus::offline()
        };
        OfflineRuntime::with_parts(
            &EngineConfig::with_data_dir("/unused"),
            kv,
            writer,
            Arc::new(ConnectivityMonitor::with_status(status)),
            Arc::new(ManualClock::starting_now()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn submitted_report_is_linked_and_reconciled() {
        let writer = Arc::new(ScriptedWriter::new());
        writer.push_ok("rep-1");
        let rt = runtime(false, writer.clone()).await;

        let (entity, item) = rt.submit_report(json!({"title": "Pothole"})).await.unwrap();
        assert_eq!(item.local_entity_id, Some(entity.local_id));
        assert_eq!(entity.sync_state, SyncState::Unsynced);
        assert_eq!(writer.call_count(), 0);

        rt.connectivity
            .report(ConnectivityStatus::online(crate::types::NetworkType::Wifi));
        rt.queue.process_queue().await;

        let stored = rt.queue.get_item(item.id).await.unwrap();
        assert_eq!(stored.status, QueueStatus::Completed);
        let entity = rt.reconciler.get(entity.local_id).await.unwrap();
        assert_eq!(entity.sync_state, SyncState::Synced);
        assert_eq!(entity.server_id.unwrap().as_str(), "rep-1");
    }

    #[tokio::test]
    async fn failed_enqueue_leaves_no_orphan_entity() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(QueueWritesFail::default());
        let rt = runtime_on(kv.clone(), false, Arc::new(ScriptedWriter::new())).await;

        let err = rt.submit_report(json!({"title": "Flooding"})).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Queue(_)));
        assert!(rt.reconciler.list().await.is_empty());
        assert_eq!(rt.queue.get_queue_status().await.total, 0);

        // Nothing comes back after a restart either.
        let reopened = runtime_on(kv, false, Arc::new(ScriptedWriter::new())).await;
        assert!(reopened.reconciler.list().await.is_empty());
    }

    #[tokio::test]
    async fn watch_path_needs_http_reads() {
        let rt = runtime(true, Arc::new(ScriptedWriter::new())).await;
        assert!(rt.read_client().is_none());
        assert!(!rt.watch_path("reports:list", "/reports", Duration::from_secs(60)));
        assert!(rt.gateway.priority_keys().is_empty());
    }
}
