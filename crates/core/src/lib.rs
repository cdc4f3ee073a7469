//! `civicsync-core`: shared primitives for the offline engine.
//!
//! This crate contains **pure** building blocks (no IO, no async):
//! identifiers, the clock abstraction and the failure taxonomy shared by the
//! queue, cache and reconciler.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, FailureKind};
pub use id::{LocalId, QueueItemId, ServerId};
