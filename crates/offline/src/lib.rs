//! `civicsync-offline`
//!
//! **Responsibility:** keep the civic-issue app usable without a network.
//!
//! This crate provides:
//! - A durable submission queue with single-flight processing and backoff
//! - A cache-first read gateway with stale-while-revalidate
//! - Optimistic local records reconciled against server ids
//! - A sync orchestrator driven by connectivity, app lifecycle and time
//!
//! The server remains the authority: local records are drafts until the
//! queue reports them accepted.

pub mod backoff;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod gateway;
pub mod http;
pub mod orchestrator;
pub mod queue;
pub mod queue_store;
pub mod reconciler;
pub mod remote;
pub mod runtime;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use cache::{Invalidation, ReadCache};
pub use config::EngineConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivityProbe};
pub use gateway::{OfflineFirstGateway, ReadOptions, ReadOutcome, ReadSource};
pub use orchestrator::{SyncOrchestrator, SyncTrigger};
pub use queue::{PassOutcome, QueueEvent, SubmissionQueue};
pub use reconciler::LocalEntityReconciler;
pub use remote::{RemoteError, RemoteWriter};
pub use runtime::OfflineRuntime;
pub use types::{ConnectivityStatus, LocalEntity, OperationType, QueueItem, QueueStatus, SyncState};
