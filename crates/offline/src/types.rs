//! Shared types for the engine components.
//!
//! Everything in this module is plain data: it is persisted through the
//! key-value substrate (`QueueItem`, `CacheEntry`, `LocalEntity`) or passed
//! between components and subscribers. No IO lives here.

use std::time::Duration;

use chrono::{DateTime, Utc};
use civicsync_core::{FailureKind, LocalId, QueueItemId, ServerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of remote write a queue item performs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Create a complete citizen report.
    SubmitReport,
    /// Any other write, named by the caller.
    Custom(String),
}

impl OperationType {
    pub fn as_str(&self) -> &str {
        match self {
            OperationType::SubmitReport => "submit_report",
            OperationType::Custom(name) => name,
        }
    }
}

impl core::fmt::Display for OperationType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a queued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pending write, durable across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub operation_type: OperationType,
    /// Fully prepared request body. The queue never inspects it.
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: QueueStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    #[serde(default)]
    pub local_entity_id: Option<LocalId>,
    #[serde(default)]
    pub server_id: Option<ServerId>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// End of the current backoff window, set after a transient failure.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// A fresh `pending` item.
    pub fn new(
        operation_type: OperationType,
        payload: Value,
        max_retries: u32,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: QueueItemId::new(),
            operation_type,
            payload,
            enqueued_at,
            retry_count: 0,
            max_retries,
            status: QueueStatus::Pending,
            last_error: None,
            failure_kind: None,
            local_entity_id: None,
            server_id: None,
            completed_at: None,
            next_attempt_at: None,
        }
    }

    /// Whether the backoff window (if any) has elapsed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// `completed` and `failed` items are never picked up automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, QueueStatus::Completed | QueueStatus::Failed)
    }
}

/// Item counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

impl QueueStatusCounts {
    pub fn tally<'a>(items: impl IntoIterator<Item = &'a QueueItem>) -> Self {
        let mut counts = Self::default();
        for item in items {
            match item.status {
                QueueStatus::Pending => counts.pending += 1,
                QueueStatus::Processing => counts.processing += 1,
                QueueStatus::Completed => counts.completed += 1,
                QueueStatus::Failed => counts.failed += 1,
            }
            counts.total += 1;
        }
        counts
    }
}

/// What happened to a queue item, as seen by the record that spawned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    /// A remote attempt started.
    InFlight,
    /// The server accepted the write.
    Succeeded { server_id: ServerId },
    /// A transient failure; another attempt is scheduled.
    Retrying { retry_count: u32, error: String },
    /// No more automatic attempts (`Permanent` or `Exhausted`).
    Failed { kind: FailureKind, error: String },
    /// A manual retry moved the item back to `pending`.
    Requeued,
}

/// One cached read result with freshness metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub fetched_at: DateTime<Utc>,
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
    /// Monotonic write sequence; the lowest is evicted first.
    pub set_seq: u64,
}

impl CacheEntry {
    /// Time since the entry was fetched (zero if the clock went backwards).
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Fresh while `now - fetched_at < ttl`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.age(now) < self.ttl
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Reconciliation state of an optimistic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Unsynced,
    Syncing,
    Synced,
    SyncFailed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Unsynced => "unsynced",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::SyncFailed => "sync_failed",
        }
    }
}

/// A record shown to the user before the server has confirmed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntity {
    pub local_id: LocalId,
    pub server_id: Option<ServerId>,
    pub sync_state: SyncState,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Transport class of the current network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    None,
    Wifi,
    Ethernet,
    Cellular,
    Unknown,
}

impl NetworkType {
    /// Wifi and ethernet are treated as unmetered.
    pub fn is_unmetered(&self) -> bool {
        matches!(self, NetworkType::Wifi | NetworkType::Ethernet)
    }
}

/// Snapshot of the device's connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityStatus {
    pub is_connected: bool,
    /// `None` while the platform has not determined reachability yet.
    pub is_internet_reachable: Option<bool>,
    pub network_type: NetworkType,
}

impl ConnectivityStatus {
    pub fn offline() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: Some(false),
            network_type: NetworkType::None,
        }
    }

    pub fn online(network_type: NetworkType) -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: Some(true),
            network_type,
        }
    }

    /// Attached to a network that does not reach the internet (captive portal).
    pub fn unreachable(network_type: NetworkType) -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: Some(false),
            network_type,
        }
    }

    /// Connected and not known to be unreachable.
    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_internet_reachable != Some(false)
    }
}

/// Foreground/background signal from the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppLifecycle {
    Foreground,
    Background,
}
