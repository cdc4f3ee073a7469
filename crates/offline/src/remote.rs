//! Remote write seam and failure classification.

use std::time::Duration;

use async_trait::async_trait;
use civicsync_core::{FailureKind, ServerId};
use serde_json::Value;
use thiserror::Error;

use crate::types::QueueItem;

/// Fields a server may use for the id of a created record, in lookup order.
const SERVER_ID_FIELDS: [&str; 3] = ["id", "_id", "report_id"];

/// What the server returned for an accepted write.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitReceipt {
    pub server_id: ServerId,
    pub body: Value,
}

/// A failed remote write.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The payload could not be turned into a request at all.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The server accepted the request but the body is unusable.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl RemoteError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Transient failures are retried; everything else fails the item.
    pub fn classify(&self) -> FailureKind {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout(_) => FailureKind::Transient,
            RemoteError::Status { status, .. } if is_transient_status(*status) => {
                FailureKind::Transient
            }
            RemoteError::Status { .. }
            | RemoteError::InvalidPayload(_)
            | RemoteError::MalformedResponse(_) => FailureKind::Permanent,
        }
    }
}

/// 5xx, request timeout and rate limiting.
pub fn is_transient_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

/// Pull the created record's id out of a success body.
pub fn extract_server_id(body: &Value) -> Result<ServerId, RemoteError> {
    let raw = SERVER_ID_FIELDS
        .iter()
        .filter_map(|field| body.get(field))
        .find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| RemoteError::MalformedResponse("response carries no record id".into()))?;

    ServerId::new(raw).map_err(|e| RemoteError::MalformedResponse(e.to_string()))
}

/// Performs the remote write of one queue item.
///
/// Implementations must be safe to call again for the same item: the queue
/// retries after ambiguous failures (timeouts), so the item id should travel
/// as an idempotency key.
#[async_trait]
pub trait RemoteWriter: Send + Sync {
    async fn submit(&self, item: &QueueItem) -> Result<SubmitReceipt, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classification_table() {
        use FailureKind::*;
        let cases = [
            (RemoteError::Network("reset".into()), Transient),
            (RemoteError::Timeout(Duration::from_secs(15)), Transient),
            (RemoteError::status(500, ""), Transient),
            (RemoteError::status(503, ""), Transient),
            (RemoteError::status(408, ""), Transient),
            (RemoteError::status(429, ""), Transient),
            (RemoteError::status(400, "title required"), Permanent),
            (RemoteError::status(401, ""), Permanent),
            (RemoteError::status(403, ""), Permanent),
            (RemoteError::status(422, ""), Permanent),
            (RemoteError::MalformedResponse("no id".into()), Permanent),
            (RemoteError::InvalidPayload("not an object".into()), Permanent),
        ];
        for (err, expected) in cases {
            assert_eq!(err.classify(), expected, "{err}");
        }
    }

    #[test]
    fn server_id_fields_are_tried_in_order() {
        assert_eq!(extract_server_id(&json!({"id": "r-1"})).unwrap().as_str(), "r-1");
        assert_eq!(extract_server_id(&json!({"_id": "mongo"})).unwrap().as_str(), "mongo");
        assert_eq!(extract_server_id(&json!({"report_id": 42})).unwrap().as_str(), "42");
        assert_eq!(
            extract_server_id(&json!({"id": "", "_id": "fallback"})).unwrap().as_str(),
            "fallback"
        );
    }

    #[test]
    fn success_without_id_is_malformed() {
        let err = extract_server_id(&json!({"ok": true})).unwrap_err();
        assert_eq!(err.classify(), FailureKind::Permanent);
        assert!(extract_server_id(&json!(null)).is_err());
    }
}
