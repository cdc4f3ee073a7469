//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern**: a pub/sub mechanism for
//! distributing status changes to multiple consumers (UI listeners, the sync
//! orchestrator, tests).
//!
//! ## Design Philosophy
//!
//! - **Explicit lifecycle**: `subscribe()` hands back a `Subscription` with an
//!   id; `unsubscribe(id)` or dropping the subscription ends it.
//! - **Broadcast semantics**: each live subscriber gets a copy of every
//!   message published after it subscribed.
//! - **No persistence**: the bus distributes notifications; durable state
//!   lives in the stores that publish them.
//! - **Non-blocking publish**: publishing never awaits a slow consumer.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

/// Identifier of one subscription on a bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl core::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A subscription to an event stream.
///
/// ## Usage Pattern
///
/// ```ignore
/// let mut sub = bus.subscribe();
/// while let Some(event) = sub.recv().await {
///     handle(event);
/// }
/// ```
///
/// Messages are received in the order they were published. A subscription is
/// meant for a single consumer task.
#[derive(Debug)]
pub struct Subscription<M> {
    id: SubscriptionId,
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(id: SubscriptionId, receiver: UnboundedReceiver<M>) -> Self {
        Self { id, receiver }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once the subscription was removed from the bus (or the
    /// bus was dropped) and all buffered messages were consumed.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain every message that is already buffered.
    pub fn drain(&mut self) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(m) = self.receiver.try_recv() {
            out.push(m);
        }
        out
    }
}

/// Transport-agnostic event bus.
///
/// The trait requires `Send + Sync`; multiple tasks can publish concurrently.
/// `publish()` failures are surfaced to the caller, who decides whether a
/// lost notification matters (it never does for durable state).
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;

    /// Remove a subscription. Returns `false` if it was already gone.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        (**self).unsubscribe(id)
    }
}
