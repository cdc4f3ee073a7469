//! Submission queue engine.
//!
//! Owns every `QueueItem` transition:
//!
//! ```text
//! pending ──claim──▶ processing ──ok──────────────▶ completed
//!    ▲                   │
//!    │                   ├─ transient, budget left ─▶ pending (+ delayed retry)
//!    │                   ├─ transient, exhausted ───▶ failed
//!    │                   └─ permanent ──────────────▶ failed
//!    └──────── retry_failed_items() ◀──────────────── failed
//! ```
//!
//! Processing passes are single-flight: a pass that is requested while one is
//! running returns [`PassOutcome::AlreadyRunning`] without doing anything.
//! Per-item failures never surface as errors to callers; they are recorded on
//! the item and published as [`QueueEvent`]s.
//!
//! A transient failure opens a backoff window (`next_attempt_at`). Ordinary
//! passes skip items inside their window; the item's own retry timer and
//! [`SubmissionQueue::process_queue_now`] do not.

use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use civicsync_core::{Clock, FailureKind, LocalId, QueueItemId, ServerId, SystemClock};
use civicsync_events::{EventBus, InMemoryEventBus, Subscription, SubscriptionId};
use civicsync_infra::{KeyValueStore, KvError};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;

use crate::backoff::RetryPolicy;
use crate::connectivity::ConnectivityMonitor;
use crate::queue_store::DurableQueueStore;
use crate::remote::{RemoteError, RemoteWriter};
use crate::types::{OperationType, QueueItem, QueueOutcome, QueueStatus, QueueStatusCounts};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(#[from] KvError),
}

/// Receives outcomes for items that carry a `local_entity_id`.
///
/// Runs before the matching [`QueueEvent`] is published.
#[async_trait]
pub trait OutcomeHandler: Send + Sync {
    async fn on_queue_outcome(&self, local_id: LocalId, outcome: QueueOutcome);
}

/// Notifications published by the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued {
        item_id: QueueItemId,
    },
    Processing {
        item_id: QueueItemId,
    },
    Completed {
        item_id: QueueItemId,
        server_id: ServerId,
    },
    RetryScheduled {
        item_id: QueueItemId,
        retry_count: u32,
        delay: Duration,
        error: String,
    },
    Failed {
        item_id: QueueItemId,
        kind: FailureKind,
        error: String,
    },
    Requeued {
        item_id: QueueItemId,
    },
    /// A `processing` item from a previous process was put back to `pending`.
    Recovered {
        item_id: QueueItemId,
    },
    Cleared {
        count: usize,
    },
}

/// Counters for one processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub attempted: usize,
    pub completed: usize,
    pub retrying: usize,
    pub failed: usize,
    /// Pending items skipped because their backoff window is still open.
    pub deferred: usize,
    /// Connectivity dropped before every pending item was attempted.
    pub interrupted: bool,
}

/// Which `pending` items a pass may attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassScope {
    Due,
    All,
    /// Due items plus the one whose retry timer fired.
    DueAnd(QueueItemId),
}

impl PassScope {
    fn admits(self, item: &QueueItem, now: DateTime<Utc>) -> bool {
        match self {
            PassScope::All => true,
            PassScope::DueAnd(id) if id == item.id => true,
            PassScope::Due | PassScope::DueAnd(_) => item.is_due(now),
        }
    }
}

fn backoff_until(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}

/// Result of asking for a processing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Ran(PassSummary),
    /// Another pass holds the guard; nothing was done.
    AlreadyRunning,
    /// The monitor reports no usable network; nothing was attempted.
    Offline,
}

/// Construction-time settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub retry: RetryPolicy,
    /// Upper bound for one remote attempt.
    pub request_timeout: Duration,
    pub clock: Arc<dyn Clock>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            clock: Arc::new(SystemClock),
        }
    }
}

enum ItemResult {
    Completed,
    Retrying,
    Failed,
    Skipped,
}

struct QueueInner {
    store: DurableQueueStore,
    writer: Arc<dyn RemoteWriter>,
    connectivity: Arc<ConnectivityMonitor>,
    settings: QueueSettings,
    processing: AtomicBool,
    pass_finished: Notify,
    events: InMemoryEventBus<QueueEvent>,
    outcome_handler: RwLock<Option<Arc<dyn OutcomeHandler>>>,
}

/// Resets the single-flight guard even if the pass future is dropped.
struct PassGuard<'a>(&'a QueueInner);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.processing.store(false, Ordering::Release);
        self.0.pass_finished.notify_waiters();
    }
}

/// Durable, retrying submission queue.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct SubmissionQueue {
    inner: Arc<QueueInner>,
}

impl core::fmt::Debug for SubmissionQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubmissionQueue")
            .field("processing", &self.is_processing())
            .finish_non_exhaustive()
    }
}

impl SubmissionQueue {
    /// Load the persisted queue and recover items interrupted mid-attempt.
    pub async fn open(
        kv: Arc<dyn KeyValueStore>,
        writer: Arc<dyn RemoteWriter>,
        connectivity: Arc<ConnectivityMonitor>,
        settings: QueueSettings,
    ) -> Result<Self, QueueError> {
        let store = DurableQueueStore::open(kv).await?;
        let queue = Self {
            inner: Arc::new(QueueInner {
                store,
                writer,
                connectivity,
                settings,
                processing: AtomicBool::new(false),
                pass_finished: Notify::new(),
                events: InMemoryEventBus::new(),
                outcome_handler: RwLock::new(None),
            }),
        };

        let recovered = queue.recover_interrupted().await?;
        queue.resume_backoff_timers().await;
        let counts = queue.get_queue_status().await;
        tracing::info!(
            pending = counts.pending,
            failed = counts.failed,
            completed = counts.completed,
            recovered,
            "submission queue opened"
        );
        Ok(queue)
    }

    /// Route item outcomes to `handler` (replaces any previous handler).
    pub fn set_outcome_handler(&self, handler: Arc<dyn OutcomeHandler>) {
        let mut slot = self
            .inner
            .outcome_handler
            .write()
            .unwrap_or_else(|p| p.into_inner());
        *slot = Some(handler);
    }

    pub async fn enqueue(
        &self,
        operation_type: OperationType,
        payload: Value,
    ) -> Result<QueueItem, QueueError> {
        self.enqueue_for(operation_type, payload, None).await
    }

    /// Persist a new `pending` item; if online, start a pass in the background.
    ///
    /// Returns once the item is durable, without waiting for delivery.
    pub async fn enqueue_for(
        &self,
        operation_type: OperationType,
        payload: Value,
        local_entity_id: Option<LocalId>,
    ) -> Result<QueueItem, QueueError> {
        let mut item = QueueItem::new(
            operation_type,
            payload,
            self.inner.settings.retry.max_retries,
            self.inner.settings.clock.now(),
        );
        item.local_entity_id = local_entity_id;

        self.inner.store.insert(item.clone()).await?;
        tracing::info!(
            item_id = %item.id,
            operation = %item.operation_type,
            local_id = ?item.local_entity_id,
            "queue item enqueued"
        );
        self.publish(QueueEvent::Enqueued { item_id: item.id });

        if self.inner.connectivity.is_online() {
            self.spawn_pass();
        }
        Ok(item)
    }

    /// Run one processing pass over the `pending` items that are due, in
    /// enqueue order.
    pub async fn process_queue(&self) -> PassOutcome {
        self.run_scoped(PassScope::Due).await
    }

    /// Like [`process_queue`](Self::process_queue), but also attempts items
    /// still inside their backoff window (manual sync, reconnect).
    pub async fn process_queue_now(&self) -> PassOutcome {
        self.run_scoped(PassScope::All).await
    }

    async fn run_scoped(&self, scope: PassScope) -> PassOutcome {
        if !self.inner.connectivity.is_online() {
            tracing::debug!("skipping queue pass: offline");
            return PassOutcome::Offline;
        }

        if self
            .inner
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("queue pass already running");
            return PassOutcome::AlreadyRunning;
        }
        let _guard = PassGuard(&self.inner);

        let summary = self.run_pass(scope).await;
        if summary.attempted > 0 {
            tracing::info!(
                attempted = summary.attempted,
                completed = summary.completed,
                retrying = summary.retrying,
                failed = summary.failed,
                deferred = summary.deferred,
                interrupted = summary.interrupted,
                "queue pass finished"
            );
        }
        PassOutcome::Ran(summary)
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire)
    }

    /// Move every `failed` item back to `pending` with a fresh retry budget.
    ///
    /// Starts a pass in the background when online.
    pub async fn retry_failed_items(&self) -> Result<usize, QueueError> {
        let requeued = self
            .inner
            .store
            .update_where(|item| {
                if item.status != QueueStatus::Failed {
                    return false;
                }
                item.status = QueueStatus::Pending;
                item.retry_count = 0;
                item.last_error = None;
                item.failure_kind = None;
                item.next_attempt_at = None;
                true
            })
            .await?;

        for item in &requeued {
            self.notify_outcome(item, QueueOutcome::Requeued).await;
            self.publish(QueueEvent::Requeued { item_id: item.id });
        }
        tracing::info!(count = requeued.len(), "failed queue items requeued");

        if !requeued.is_empty() && self.inner.connectivity.is_online() {
            self.spawn_pass();
        }
        Ok(requeued.len())
    }

    /// Purge `completed` items.
    pub async fn clear_completed(&self) -> Result<usize, QueueError> {
        let count = self
            .inner
            .store
            .remove_where(|item| item.status == QueueStatus::Completed)
            .await?;
        if count > 0 {
            tracing::info!(count, "completed queue items cleared");
            self.publish(QueueEvent::Cleared { count });
        }
        Ok(count)
    }

    /// Reset items left in `processing` by a process that died mid-attempt.
    ///
    /// The attempt's outcome is unknown, so it does not consume retry budget;
    /// the idempotency key makes the re-send safe.
    pub async fn recover_interrupted(&self) -> Result<usize, QueueError> {
        let recovered = self
            .inner
            .store
            .update_where(|item| {
                if item.status != QueueStatus::Processing {
                    return false;
                }
                item.status = QueueStatus::Pending;
                true
            })
            .await?;

        for item in &recovered {
            tracing::warn!(item_id = %item.id, "recovered interrupted queue item");
            self.publish(QueueEvent::Recovered { item_id: item.id });
        }
        Ok(recovered.len())
    }

    pub async fn get_queue_status(&self) -> QueueStatusCounts {
        QueueStatusCounts::tally(&self.inner.store.list().await)
    }

    pub async fn get_queue_items(&self) -> Vec<QueueItem> {
        self.inner.store.list().await
    }

    pub async fn get_item(&self, id: QueueItemId) -> Option<QueueItem> {
        self.inner.store.get(id).await
    }

    pub fn subscribe(&self) -> Subscription<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    fn spawn_pass(&self) {
        let queue = self.clone();
        tokio::spawn(async move {
            queue.process_queue().await;
        });
    }

    async fn run_pass(&self, scope: PassScope) -> PassSummary {
        let now = self.inner.settings.clock.now();
        let mut summary = PassSummary::default();
        let mut candidates = Vec::new();
        for item in self.inner.store.list().await {
            if item.status != QueueStatus::Pending {
                continue;
            }
            if scope.admits(&item, now) {
                candidates.push(item.id);
            } else {
                summary.deferred += 1;
            }
        }

        for id in candidates {
            if !self.inner.connectivity.is_online() {
                tracing::info!("connectivity lost; stopping queue pass");
                summary.interrupted = true;
                break;
            }

            match self.process_item(id).await {
                ItemResult::Completed => summary.completed += 1,
                ItemResult::Retrying => summary.retrying += 1,
                ItemResult::Failed => summary.failed += 1,
                ItemResult::Skipped => continue,
            }
            summary.attempted += 1;
        }
        summary
    }

    async fn process_item(&self, id: QueueItemId) -> ItemResult {
        // The status check and the claim happen under the store lock.
        let claimed = self
            .inner
            .store
            .update(id, |item| {
                if item.status != QueueStatus::Pending {
                    return None;
                }
                item.status = QueueStatus::Processing;
                Some(item.clone())
            })
            .await;

        let item = match claimed {
            Ok(Some(Some(item))) => item,
            Ok(_) => return ItemResult::Skipped,
            Err(err) => {
                tracing::error!(item_id = %id, error = %err, "failed to persist claim; attempting anyway");
                match self.inner.store.get(id).await {
                    Some(item) if item.status == QueueStatus::Processing => item,
                    _ => return ItemResult::Skipped,
                }
            }
        };

        tracing::debug!(item_id = %item.id, retry_count = item.retry_count, "submitting queue item");
        self.notify_outcome(&item, QueueOutcome::InFlight).await;
        self.publish(QueueEvent::Processing { item_id: item.id });

        let timeout = self.inner.settings.request_timeout;
        let result = match tokio::time::timeout(timeout, self.inner.writer.submit(&item)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(timeout)),
        };

        match result {
            Ok(receipt) => self.complete(item, receipt.server_id).await,
            Err(err) => self.fail(item, err).await,
        }
    }

    async fn complete(&self, item: QueueItem, server_id: ServerId) -> ItemResult {
        let now = self.inner.settings.clock.now();
        let sid = server_id.clone();
        if let Err(err) = self
            .inner
            .store
            .update(item.id, move |i| {
                i.status = QueueStatus::Completed;
                i.server_id = Some(sid);
                i.completed_at = Some(now);
                i.last_error = None;
                i.failure_kind = None;
                i.next_attempt_at = None;
            })
            .await
        {
            tracing::error!(item_id = %item.id, error = %err, "failed to persist completion");
        }

        tracing::info!(item_id = %item.id, server_id = %server_id, "queue item completed");
        self.notify_outcome(
            &item,
            QueueOutcome::Succeeded {
                server_id: server_id.clone(),
            },
        )
        .await;
        self.publish(QueueEvent::Completed {
            item_id: item.id,
            server_id,
        });
        ItemResult::Completed
    }

    async fn fail(&self, item: QueueItem, err: RemoteError) -> ItemResult {
        let message = err.to_string();
        let kind = err.classify();
        let now = self.inner.settings.clock.now();
        let retry = &self.inner.settings.retry;

        let updated = self
            .inner
            .store
            .update(item.id, |i| {
                i.last_error = Some(message.clone());
                i.next_attempt_at = None;
                if kind.is_retryable() {
                    i.retry_count += 1;
                    if RetryPolicy::should_retry(i.retry_count, i.max_retries) {
                        i.status = QueueStatus::Pending;
                        i.failure_kind = Some(FailureKind::Transient);
                        i.next_attempt_at =
                            backoff_until(now, retry.delay_for_retry(i.retry_count));
                    } else {
                        i.status = QueueStatus::Failed;
                        i.failure_kind = Some(FailureKind::Exhausted);
                    }
                } else {
                    i.status = QueueStatus::Failed;
                    i.failure_kind = Some(FailureKind::Permanent);
                }
                i.clone()
            })
            .await;

        let updated = match updated {
            Ok(Some(updated)) => updated,
            Ok(None) => return ItemResult::Skipped,
            Err(err) => {
                tracing::error!(item_id = %item.id, error = %err, "failed to persist failure");
                match self.inner.store.get(item.id).await {
                    Some(updated) => updated,
                    None => return ItemResult::Skipped,
                }
            }
        };

        if updated.status == QueueStatus::Pending {
            let delay = retry.delay_for_retry(updated.retry_count);
            tracing::warn!(
                item_id = %updated.id,
                retry_count = updated.retry_count,
                max_retries = updated.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "transient submission failure; retry scheduled"
            );
            self.notify_outcome(
                &updated,
                QueueOutcome::Retrying {
                    retry_count: updated.retry_count,
                    error: message.clone(),
                },
            )
            .await;
            self.publish(QueueEvent::RetryScheduled {
                item_id: updated.id,
                retry_count: updated.retry_count,
                delay,
                error: message,
            });
            self.schedule_retry(updated.id, delay);
            return ItemResult::Retrying;
        }

        let kind = updated.failure_kind.unwrap_or(FailureKind::Permanent);
        tracing::error!(
            item_id = %updated.id,
            kind = %kind,
            retry_count = updated.retry_count,
            error = %message,
            "queue item failed"
        );
        self.notify_outcome(
            &updated,
            QueueOutcome::Failed {
                kind,
                error: message.clone(),
            },
        )
        .await;
        self.publish(QueueEvent::Failed {
            item_id: updated.id,
            kind,
            error: message,
        });
        ItemResult::Failed
    }

    /// Re-arm retry timers for items persisted inside a backoff window.
    async fn resume_backoff_timers(&self) {
        let now = self.inner.settings.clock.now();
        for item in self.inner.store.list().await {
            let Some(at) = item.next_attempt_at else {
                continue;
            };
            if item.status == QueueStatus::Pending && at > now {
                let delay = (at - now).to_std().unwrap_or_default();
                tracing::debug!(item_id = %item.id, delay_ms = delay.as_millis() as u64, "resuming backoff timer");
                self.schedule_retry(item.id, delay);
            }
        }
    }

    fn schedule_retry(&self, id: QueueItemId, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.run_scheduled_retry(id).await;
        });
    }

    /// Fire a delayed retry. A no-op unless the item is still `pending`;
    /// waits out a running pass and checks again.
    async fn run_scheduled_retry(&self, id: QueueItemId) {
        loop {
            match self.inner.store.get(id).await {
                Some(item) if item.status == QueueStatus::Pending => {}
                _ => {
                    tracing::debug!(item_id = %id, "retry timer superseded");
                    return;
                }
            }

            let mut finished = pin!(self.inner.pass_finished.notified());
            finished.as_mut().enable();

            match self.run_scoped(PassScope::DueAnd(id)).await {
                PassOutcome::AlreadyRunning => finished.await,
                PassOutcome::Ran(_) | PassOutcome::Offline => return,
            }
        }
    }

    async fn notify_outcome(&self, item: &QueueItem, outcome: QueueOutcome) {
        let Some(local_id) = item.local_entity_id else {
            return;
        };
        let handler = self
            .inner
            .outcome_handler
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler.on_queue_outcome(local_id, outcome).await;
        }
    }

    fn publish(&self, event: QueueEvent) {
        if let Err(err) = self.inner.events.publish(event) {
            tracing::error!(error = %err, "failed to publish queue event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedWriter;
    use crate::types::{ConnectivityStatus, NetworkType};
    use civicsync_infra::InMemoryKvStore;
    use serde_json::json;
    use std::sync::Mutex;

    struct Harness {
        kv: Arc<dyn KeyValueStore>,
        writer: Arc<ScriptedWriter>,
        monitor: Arc<ConnectivityMonitor>,
        queue: SubmissionQueue,
    }

    async fn harness(online: bool) -> Harness {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvStore::new());
        let writer = Arc::new(ScriptedWriter::new());
        let status = if online {
            ConnectivityStatus::online(NetworkType::Wifi)
        } else {
            ConnectivityStatus::offline()
        };
        let monitor = Arc::new(ConnectivityMonitor::with_status(status));
        let queue = SubmissionQueue::open(
            kv.clone(),
            writer.clone(),
            monitor.clone(),
            QueueSettings::default(),
        )
        .await
        .unwrap();
        Harness {
            kv,
            writer,
            monitor,
            queue,
        }
    }

    async fn wait_for_terminal(sub: &mut Subscription<QueueEvent>) -> QueueEvent {
        loop {
            match sub.recv().await.unwrap() {
                e @ (QueueEvent::Completed { .. } | QueueEvent::Failed { .. }) => return e,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn offline_enqueue_stays_pending() {
        let h = harness(false).await;
        let item = h
            .queue
            .enqueue(OperationType::SubmitReport, json!({"title": "Broken light"}))
            .await
            .unwrap();

        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(h.queue.process_queue().await, PassOutcome::Offline);
        assert_eq!(h.writer.call_count(), 0);
        assert_eq!(h.queue.get_queue_status().await.pending, 1);
    }

    #[tokio::test]
    async fn online_enqueue_starts_a_pass() {
        let h = harness(true).await;
        let mut sub = h.queue.subscribe();
        let item = h
            .queue
            .enqueue(OperationType::SubmitReport, json!({}))
            .await
            .unwrap();

        match wait_for_terminal(&mut sub).await {
            QueueEvent::Completed { item_id, .. } => assert_eq!(item_id, item.id),
            other => panic!("unexpected event {other:?}"),
        }
        let stored = h.queue.get_item(item.id).await.unwrap();
        assert_eq!(stored.status, QueueStatus::Completed);
        assert!(stored.server_id.is_some());
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn items_are_attempted_in_enqueue_order() {
        let h = harness(false).await;
        let mut ids = Vec::new();
        for n in 0..4 {
            ids.push(
                h.queue
                    .enqueue(OperationType::SubmitReport, json!({ "n": n }))
                    .await
                    .unwrap()
                    .id,
            );
        }

        h.monitor.report(ConnectivityStatus::online(NetworkType::Wifi));
        let outcome = h.queue.process_queue().await;
        assert!(matches!(outcome, PassOutcome::Ran(PassSummary { completed: 4, .. })));
        assert_eq!(h.writer.calls(), ids);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_pass_is_a_no_op() {
        let h = harness(false).await;
        h.queue
            .enqueue(OperationType::SubmitReport, json!({}))
            .await
            .unwrap();
        h.writer.push_delay_ok(Duration::from_secs(3), "srv-slow");
        h.monitor.report(ConnectivityStatus::online(NetworkType::Wifi));

        let (first, second) = tokio::join!(h.queue.process_queue(), async {
            tokio::task::yield_now().await;
            h.queue.process_queue().await
        });

        assert!(matches!(first, PassOutcome::Ran(PassSummary { completed: 1, .. })));
        assert_eq!(second, PassOutcome::AlreadyRunning);
        assert_eq!(h.writer.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_request_times_out_as_transient() {
        let h = harness(false).await;
        let item = h
            .queue
            .enqueue(OperationType::SubmitReport, json!({}))
            .await
            .unwrap();
        h.writer.push_hang();
        h.monitor.report(ConnectivityStatus::online(NetworkType::Wifi));

        let outcome = h.queue.process_queue().await;
        assert!(matches!(outcome, PassOutcome::Ran(PassSummary { retrying: 1, .. })));

        let stored = h.queue.get_item(item.id).await.unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.status, QueueStatus::Pending);
        assert_eq!(stored.failure_kind, Some(FailureKind::Transient));
        assert!(stored.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn permanent_failure_keeps_retry_count() {
        let h = harness(false).await;
        let item = h
            .queue
            .enqueue(OperationType::SubmitReport, json!({}))
            .await
            .unwrap();
        h.writer.push_err(RemoteError::status(422, "title is required"));
        h.monitor.report(ConnectivityStatus::online(NetworkType::Wifi));

        h.queue.process_queue().await;
        let stored = h.queue.get_item(item.id).await.unwrap();
        assert_eq!(stored.status, QueueStatus::Failed);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.failure_kind, Some(FailureKind::Permanent));

        // Failed items are never picked up again automatically.
        h.queue.process_queue().await;
        assert_eq!(h.writer.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_the_budget() {
        let h = harness(false).await;
        let mut sub = h.queue.subscribe();
        let item = h
            .queue
            .enqueue(OperationType::SubmitReport, json!({}))
            .await
            .unwrap();
        for _ in 0..5 {
            h.writer.push_err(RemoteError::status(503, "unavailable"));
        }
        h.monitor.report(ConnectivityStatus::online(NetworkType::Wifi));
        h.queue.process_queue().await;

        match wait_for_terminal(&mut sub).await {
            QueueEvent::Failed { kind, .. } => assert_eq!(kind, FailureKind::Exhausted),
            other => panic!("unexpected event {other:?}"),
        }
        let stored = h.queue.get_item(item.id).await.unwrap();
        assert_eq!(stored.retry_count, 5);
        assert_eq!(stored.status, QueueStatus::Failed);
        assert_eq!(h.writer.call_count(), 5);
    }

    #[tokio::test]
    async fn backed_off_items_wait_unless_forced() {
        let h = harness(false).await;
        let item = h
            .queue
            .enqueue(OperationType::SubmitReport, json!({}))
            .await
            .unwrap();
        h.writer.push_err(RemoteError::Network("reset".into()));
        h.monitor.report(ConnectivityStatus::online(NetworkType::Wifi));
        h.queue.process_queue().await;

        let stored = h.queue.get_item(item.id).await.unwrap();
        assert_eq!(stored.status, QueueStatus::Pending);
        assert!(!stored.is_due(chrono::Utc::now()));

        let outcome = h.queue.process_queue().await;
        assert!(matches!(
            outcome,
            PassOutcome::Ran(PassSummary { attempted: 0, deferred: 1, .. })
        ));
        assert_eq!(h.writer.call_count(), 1);

        let outcome = h.queue.process_queue_now().await;
        assert!(matches!(outcome, PassOutcome::Ran(PassSummary { completed: 1, .. })));
        let stored = h.queue.get_item(item.id).await.unwrap();
        assert_eq!(stored.status, QueueStatus::Completed);
        assert_eq!(stored.next_attempt_at, None);
        assert_eq!(h.writer.call_count(), 2);
    }

    #[tokio::test]
    async fn retry_failed_items_resets_and_redelivers() {
        let h = harness(false).await;
        let item = h
            .queue
            .enqueue(OperationType::SubmitReport, json!({}))
            .await
            .unwrap();
        h.writer.push_err(RemoteError::status(400, "bad"));
        h.monitor.report(ConnectivityStatus::online(NetworkType::Wifi));
        h.queue.process_queue().await;
        assert_eq!(h.queue.get_queue_status().await.failed, 1);

        let mut sub = h.queue.subscribe();
        assert_eq!(h.queue.retry_failed_items().await.unwrap(), 1);
        match sub.recv().await.unwrap() {
            QueueEvent::Requeued { item_id } => assert_eq!(item_id, item.id),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            wait_for_terminal(&mut sub).await,
            QueueEvent::Completed { .. }
        ));
        let stored = h.queue.get_item(item.id).await.unwrap();
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.last_error, None);
    }

    #[tokio::test]
    async fn clear_completed_only_purges_completed() {
        let h = harness(false).await;
        h.queue
            .enqueue(OperationType::SubmitReport, json!({}))
            .await
            .unwrap();
        h.queue
            .enqueue(OperationType::SubmitReport, json!({}))
            .await
            .unwrap();
        h.writer.push_ok("srv-1");
        h.writer.push_err(RemoteError::status(403, "forbidden"));
        h.monitor.report(ConnectivityStatus::online(NetworkType::Wifi));
        h.queue.process_queue().await;

        assert_eq!(h.queue.clear_completed().await.unwrap(), 1);
        let counts = h.queue.get_queue_status().await;
        assert_eq!(counts.total, 1);
        assert_eq!(counts.failed, 1);
    }

    #[tokio::test]
    async fn interrupted_items_are_recovered_on_open() {
        let h = harness(false).await;
        let item = h
            .queue
            .enqueue(OperationType::SubmitReport, json!({}))
            .await
            .unwrap();
        let store = DurableQueueStore::open(h.kv.clone()).await.unwrap();
        store
            .update(item.id, |i| i.status = QueueStatus::Processing)
            .await
            .unwrap();

        let reopened = SubmissionQueue::open(
            h.kv.clone(),
            h.writer.clone(),
            h.monitor.clone(),
            QueueSettings::default(),
        )
        .await
        .unwrap();
        let stored = reopened.get_item(item.id).await.unwrap();
        assert_eq!(stored.status, QueueStatus::Pending);
        assert_eq!(stored.retry_count, 0);
    }

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<(LocalId, QueueOutcome)>>,
    }

    #[async_trait]
    impl OutcomeHandler for RecordingHandler {
        async fn on_queue_outcome(&self, local_id: LocalId, outcome: QueueOutcome) {
            self.seen.lock().unwrap().push((local_id, outcome));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn outcomes_reach_the_handler() {
        let h = harness(false).await;
        let handler = Arc::new(RecordingHandler::default());
        h.queue.set_outcome_handler(handler.clone());

        let local_id = LocalId::new();
        h.queue
            .enqueue_for(OperationType::SubmitReport, json!({}), Some(local_id))
            .await
            .unwrap();
        h.queue
            .enqueue(OperationType::SubmitReport, json!({}))
            .await
            .unwrap();
        h.writer.push_err(RemoteError::Network("reset".into()));
        h.writer.push_ok("srv-7");
        h.writer.push_ok("srv-8");

        let mut sub = h.queue.subscribe();
        h.monitor.report(ConnectivityStatus::online(NetworkType::Wifi));
        h.queue.process_queue().await;
        wait_for_terminal(&mut sub).await;
        wait_for_terminal(&mut sub).await;

        let seen: Vec<QueueOutcome> = handler
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|(id, o)| {
                assert_eq!(*id, local_id);
                o.clone()
            })
            .collect();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], QueueOutcome::InFlight);
        assert!(matches!(seen[1], QueueOutcome::Retrying { retry_count: 1, .. }));
        assert_eq!(seen[2], QueueOutcome::InFlight);
        assert!(matches!(seen[3], QueueOutcome::Succeeded { .. }));
    }
}
