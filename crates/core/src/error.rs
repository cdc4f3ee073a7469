//! Core error model and the failure taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core-level error.
///
/// Keep this focused on deterministic failures of the primitives themselves.
/// IO and network concerns belong to the crates that perform them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// Classification of a failed remote write.
///
/// - `Transient`: expected to resolve on retry (network, timeout, 5xx).
/// - `Permanent`: will not resolve by retrying (validation, authorization).
/// - `Exhausted`: was transient but ran out of retry budget; functionally
///   permanent until a manual retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
    Exhausted,
}

impl FailureKind {
    /// Whether an automatic retry may still resolve the failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::Exhausted => "exhausted",
        }
    }
}

impl core::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(FailureKind::Transient.is_retryable());
        assert!(!FailureKind::Permanent.is_retryable());
        assert!(!FailureKind::Exhausted.is_retryable());
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::Exhausted).unwrap();
        assert_eq!(json, "\"exhausted\"");
    }
}
