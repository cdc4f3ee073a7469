//! Strongly-typed identifiers used across the engine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Identifier of a queued write (generated at enqueue time).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueItemId(Uuid);

/// Client-generated identifier of an optimistic local record.
///
/// Stable for the record's whole offline lifetime and never reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered), so ids sort in creation order.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| CoreError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(QueueItemId, "QueueItemId");
impl_uuid_newtype!(LocalId, "LocalId");

/// Server-assigned identifier, opaque to the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Result<Self, CoreError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(CoreError::invalid_id("ServerId: empty"));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ServerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServerId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_distinct() {
        assert_ne!(QueueItemId::new(), QueueItemId::new());
        assert_ne!(LocalId::new(), LocalId::new());
    }

    #[test]
    fn local_id_round_trips_through_display() {
        let id = LocalId::new();
        let parsed: LocalId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn invalid_uuid_is_rejected() {
        let err = "not-a-uuid".parse::<QueueItemId>().unwrap_err();
        assert!(matches!(err, CoreError::InvalidId(msg) if msg.starts_with("QueueItemId")));
    }

    #[test]
    fn server_id_rejects_blank() {
        assert!(ServerId::new("  ").is_err());
        assert_eq!(ServerId::new("rep-42").unwrap().as_str(), "rep-42");
    }

    proptest::proptest! {
        #[test]
        fn server_id_keeps_any_non_blank_text(id in "[ ]{0,3}[a-zA-Z0-9_-]{1,24}[ ]{0,3}") {
            let parsed: ServerId = id.parse().unwrap();
            proptest::prop_assert_eq!(parsed.as_str(), id.as_str());
        }
    }
}
