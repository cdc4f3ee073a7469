//! Background sync orchestration.
//!
//! Decides *when* the queue is processed and priority reads are revalidated.
//! Triggers:
//!
//! - connectivity restored (monitor transition to online)
//! - app returns to the foreground
//! - periodic timer: shorter on unmetered networks, longer on cellular,
//!   suspended while the app is in the background
//! - manual [`SyncOrchestrator::force_sync`]
//!
//! While the monitor has a probe, the loop also re-polls it on its own
//! interval so a return to connectivity is noticed without a platform push.
//! Every trigger except the periodic timer also attempts queue items still
//! inside their backoff window.
//!
//! Sync passes are single-flight on their own guard; overlapping requests
//! collapse into the running pass. The queue's guard is never held here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use civicsync_events::{EventBus, InMemoryEventBus, Subscription, SubscriptionId};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::connectivity::ConnectivityMonitor;
use crate::gateway::{OfflineFirstGateway, RevalidationSummary};
use crate::queue::{PassOutcome, SubmissionQueue};
use crate::types::{AppLifecycle, NetworkType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTrigger {
    Foreground,
    ConnectivityRestored,
    Periodic,
    Manual,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Foreground => "foreground",
            SyncTrigger::ConnectivityRestored => "connectivity_restored",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Manual => "manual",
        }
    }

    fn overrides_backoff(&self) -> bool {
        !matches!(self, SyncTrigger::Periodic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Syncing,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub unmetered_interval: Duration,
    pub cellular_interval: Duration,
    /// Re-probe connectivity (backend health) before touching the queue.
    pub preflight_health_check: bool,
    /// How often the run loop re-polls the connectivity probe.
    pub connectivity_poll_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            unmetered_interval: Duration::from_secs(30),
            cellular_interval: Duration::from_secs(120),
            preflight_health_check: true,
            connectivity_poll_interval: Duration::from_secs(15),
        }
    }
}

/// What one sync pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub queue: PassOutcome,
    pub revalidation: RevalidationSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// A sync pass was already running; this request joined it.
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    Started(SyncTrigger),
    Finished(SyncReport),
}

/// Coordinates queue processing and cache revalidation.
pub struct SyncOrchestrator {
    queue: SubmissionQueue,
    gateway: OfflineFirstGateway,
    connectivity: Arc<ConnectivityMonitor>,
    settings: OrchestratorSettings,
    syncing: AtomicBool,
    lifecycle: watch::Sender<AppLifecycle>,
    shutdown: Notify,
    events: InMemoryEventBus<SyncEvent>,
}

impl core::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("phase", &self.phase())
            .field("lifecycle", &self.lifecycle())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncOrchestrator {
    pub fn new(
        queue: SubmissionQueue,
        gateway: OfflineFirstGateway,
        connectivity: Arc<ConnectivityMonitor>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (lifecycle, _) = watch::channel(AppLifecycle::Foreground);
        Self {
            queue,
            gateway,
            connectivity,
            settings,
            syncing: AtomicBool::new(false),
            lifecycle,
            shutdown: Notify::new(),
            events: InMemoryEventBus::new(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        if self.syncing.load(Ordering::Acquire) {
            SyncPhase::Syncing
        } else {
            SyncPhase::Idle
        }
    }

    pub fn lifecycle(&self) -> AppLifecycle {
        *self.lifecycle.borrow()
    }

    /// Feed the host application's foreground/background state.
    pub fn set_lifecycle(&self, state: AppLifecycle) {
        let previous = self.lifecycle.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, current = ?state, "app lifecycle changed");
        }
    }

    /// Periodic interval for the current network, `None` while backgrounded.
    pub fn periodic_interval(&self) -> Option<Duration> {
        if self.lifecycle() == AppLifecycle::Background {
            return None;
        }
        match self.connectivity.get_status().network_type {
            NetworkType::Wifi | NetworkType::Ethernet => Some(self.settings.unmetered_interval),
            NetworkType::Cellular | NetworkType::Unknown | NetworkType::None => {
                Some(self.settings.cellular_interval)
            }
        }
    }

    pub async fn force_sync(&self) -> SyncOutcome {
        self.sync_now(SyncTrigger::Manual).await
    }

    /// Run one sync pass unless another one is running.
    pub async fn sync_now(&self, trigger: SyncTrigger) -> SyncOutcome {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(trigger = trigger.as_str(), "sync already running");
            return SyncOutcome::AlreadyRunning;
        }
        let _guard = SyncGuard(&self.syncing);

        tracing::debug!(trigger = trigger.as_str(), "sync started");
        self.publish(SyncEvent::Started(trigger));

        if self.settings.preflight_health_check {
            let status = self.connectivity.refresh().await;
            if !status.is_online() {
                tracing::debug!(trigger = trigger.as_str(), "preflight check failed");
            }
        }

        let queue = if trigger.overrides_backoff() {
            self.queue.process_queue_now().await
        } else {
            self.queue.process_queue().await
        };
        let revalidation = self.gateway.revalidate_priority().await;
        let report = SyncReport {
            trigger,
            queue,
            revalidation,
        };

        tracing::info!(
            trigger = trigger.as_str(),
            queue = ?report.queue,
            refreshed = revalidation.refreshed,
            "sync finished"
        );
        self.publish(SyncEvent::Finished(report));
        SyncOutcome::Completed(report)
    }

    /// Spawn the trigger loop. Stop it with [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    /// Ask the trigger loop to exit after the current pass.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub fn subscribe(&self) -> Subscription<SyncEvent> {
        self.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    async fn run(&self) {
        tracing::info!("sync orchestrator started");
        let mut connectivity = self.connectivity.subscribe();
        let mut lifecycle = self.lifecycle.subscribe();
        let mut next_tick = self.next_deadline();

        let polling = self.connectivity.has_probe();
        let mut poll = tokio::time::interval(
            self.settings
                .connectivity_poll_interval
                .max(Duration::from_secs(1)),
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let tick = async move {
                match next_tick {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.shutdown.notified() => break,
                change = connectivity.recv() => {
                    let Some(change) = change else { break };
                    if change.became_online() {
                        self.sync_now(SyncTrigger::ConnectivityRestored).await;
                    }
                    next_tick = self.next_deadline();
                }
                changed = lifecycle.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *lifecycle.borrow_and_update();
                    if state == AppLifecycle::Foreground {
                        self.sync_now(SyncTrigger::Foreground).await;
                    }
                    next_tick = self.next_deadline();
                }
                _ = tick => {
                    self.sync_now(SyncTrigger::Periodic).await;
                    next_tick = self.next_deadline();
                }
                _ = poll.tick(), if polling => {
                    // A transition lands on `connectivity` above.
                    self.connectivity.refresh().await;
                }
            }
        }

        self.connectivity.unsubscribe(connectivity.id());
        tracing::info!("sync orchestrator stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.periodic_interval().map(|d| Instant::now() + d)
    }

    fn publish(&self, event: SyncEvent) {
        if let Err(err) = self.events.publish(event) {
            tracing::error!(error = %err, "failed to publish sync event");
        }
    }
}
