//! Test doubles for the engine's seams.
//!
//! Compiled for the crate's own tests and, behind the `testing` feature, for
//! integration tests. They perform no IO.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use civicsync_core::{QueueItemId, ServerId};
use serde_json::json;

use crate::connectivity::ConnectivityProbe;
use crate::remote::{RemoteError, RemoteWriter, SubmitReceipt};
use crate::types::{ConnectivityStatus, QueueItem};

/// One scripted response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Ok(String),
    Err(RemoteError),
    /// Wait, then succeed with the given id.
    DelayOk(Duration, String),
    /// Never answer; the queue's per-attempt timeout must fire.
    Hang,
}

/// A `RemoteWriter` that replays scripted responses in order.
///
/// Once the script runs out every call succeeds with a generated id
/// (`srv-1`, `srv-2`, ...).
#[derive(Debug, Default)]
pub struct ScriptedWriter {
    script: Mutex<VecDeque<ScriptStep>>,
    calls: Mutex<Vec<QueueItemId>>,
    generated: AtomicU64,
}

impl ScriptedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, step: ScriptStep) {
        self.lock_script().push_back(step);
    }

    pub fn push_ok(&self, server_id: &str) {
        self.push(ScriptStep::Ok(server_id.to_string()));
    }

    pub fn push_err(&self, err: RemoteError) {
        self.push(ScriptStep::Err(err));
    }

    pub fn push_delay_ok(&self, delay: Duration, server_id: &str) {
        self.push(ScriptStep::DelayOk(delay, server_id.to_string()));
    }

    pub fn push_hang(&self) {
        self.push(ScriptStep::Hang);
    }

    /// Item ids in the order they were submitted (retries included).
    pub fn calls(&self) -> Vec<QueueItemId> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// How many times `id` was submitted.
    pub fn calls_for(&self, id: QueueItemId) -> usize {
        self.calls().into_iter().filter(|c| *c == id).count()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<ScriptStep>> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn receipt(server_id: String) -> Result<SubmitReceipt, RemoteError> {
        let server_id =
            ServerId::new(server_id).map_err(|e| RemoteError::MalformedResponse(e.to_string()))?;
        Ok(SubmitReceipt {
            body: json!({ "id": server_id.as_str() }),
            server_id,
        })
    }
}

#[async_trait]
impl RemoteWriter for ScriptedWriter {
    async fn submit(&self, item: &QueueItem) -> Result<SubmitReceipt, RemoteError> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(item.id);

        let step = self.lock_script().pop_front();
        match step {
            Some(ScriptStep::Ok(id)) => Self::receipt(id),
            Some(ScriptStep::Err(err)) => Err(err),
            Some(ScriptStep::DelayOk(delay, id)) => {
                tokio::time::sleep(delay).await;
                Self::receipt(id)
            }
            Some(ScriptStep::Hang) => std::future::pending().await,
            None => {
                let n = self.generated.fetch_add(1, Ordering::Relaxed) + 1;
                Self::receipt(format!("srv-{n}"))
            }
        }
    }
}

/// A `ConnectivityProbe` that answers whatever it was last set to.
#[derive(Debug)]
pub struct StaticProbe {
    status: Mutex<ConnectivityStatus>,
}

impl StaticProbe {
    pub fn new(status: ConnectivityStatus) -> Self {
        Self {
            status: Mutex::new(status),
        }
    }

    pub fn set(&self, status: ConnectivityStatus) {
        *self.status.lock().unwrap_or_else(|p| p.into_inner()) = status;
    }
}

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn probe(&self) -> ConnectivityStatus {
        *self.status.lock().unwrap_or_else(|p| p.into_inner())
    }
}
