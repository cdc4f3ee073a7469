//! Connectivity detection and change notification.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use civicsync_events::{EventBus, InMemoryEventBus, Subscription, SubscriptionId};

use crate::types::ConnectivityStatus;

/// Platform seam that reports the device's current connectivity.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync + core::fmt::Debug {
    async fn probe(&self) -> ConnectivityStatus;
}

/// A status transition, delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityChange {
    pub previous: ConnectivityStatus,
    pub current: ConnectivityStatus,
}

impl ConnectivityChange {
    pub fn became_online(&self) -> bool {
        !self.previous.is_online() && self.current.is_online()
    }

    pub fn went_offline(&self) -> bool {
        self.previous.is_online() && !self.current.is_online()
    }
}

/// Tracks the current connectivity status and fans out transitions.
///
/// Status is fed either by pushing platform events through [`report`] or by
/// polling the probe through [`refresh`]. Nothing is persisted: a new monitor
/// always starts from a fresh probe (or an explicit initial status).
///
/// [`report`]: ConnectivityMonitor::report
/// [`refresh`]: ConnectivityMonitor::refresh
#[derive(Debug)]
pub struct ConnectivityMonitor {
    status: RwLock<ConnectivityStatus>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    changes: InMemoryEventBus<ConnectivityChange>,
}

impl ConnectivityMonitor {
    /// Query the probe once and start from its answer.
    pub async fn start(probe: Arc<dyn ConnectivityProbe>) -> Self {
        let initial = probe.probe().await;
        tracing::info!(
            connected = initial.is_connected,
            reachable = ?initial.is_internet_reachable,
            network = ?initial.network_type,
            "connectivity monitor started"
        );
        Self {
            status: RwLock::new(initial),
            probe: Some(probe),
            changes: InMemoryEventBus::new(),
        }
    }

    /// Push-only monitor with a known initial status.
    pub fn with_status(initial: ConnectivityStatus) -> Self {
        Self {
            status: RwLock::new(initial),
            probe: None,
            changes: InMemoryEventBus::new(),
        }
    }

    pub fn get_status(&self) -> ConnectivityStatus {
        *self.status.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_online(&self) -> bool {
        self.get_status().is_online()
    }

    /// Whether [`refresh`](Self::refresh) can query anything.
    pub fn has_probe(&self) -> bool {
        self.probe.is_some()
    }

    /// Record a status from the platform. Returns `true` if it changed.
    pub fn report(&self, current: ConnectivityStatus) -> bool {
        let previous = {
            let mut status = self.status.write().unwrap_or_else(|p| p.into_inner());
            let previous = *status;
            if previous == current {
                return false;
            }
            *status = current;
            previous
        };

        let change = ConnectivityChange { previous, current };
        if change.became_online() {
            tracing::info!(network = ?current.network_type, "connectivity restored");
        } else if change.went_offline() {
            tracing::warn!(
                connected = current.is_connected,
                reachable = ?current.is_internet_reachable,
                "connectivity lost"
            );
        } else {
            tracing::debug!(?previous, ?current, "connectivity changed");
        }

        if let Err(err) = self.changes.publish(change) {
            tracing::error!(error = %err, "failed to publish connectivity change");
        }
        true
    }

    /// Re-query the probe (if any) and report its answer.
    pub async fn refresh(&self) -> ConnectivityStatus {
        match &self.probe {
            Some(probe) => {
                let status = probe.probe().await;
                self.report(status);
                status
            }
            None => self.get_status(),
        }
    }

    pub fn subscribe(&self) -> Subscription<ConnectivityChange> {
        self.changes.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.changes.unsubscribe(id)
    }
}
