//! In-process publish/subscribe used for engine status changes.
//!
//! Queue transitions, connectivity changes and cache refreshes are published
//! on an `EventBus`; UI glue and the sync orchestrator hold `Subscription`s.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription, SubscriptionId};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
