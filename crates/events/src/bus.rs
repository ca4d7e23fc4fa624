//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes field changes to whoever renders the document (a grid,
//! a sync worker). It is intentionally lightweight:
//!
//! - **Transport-agnostic**: in-memory channels today, anything else later
//! - **Best-effort**: the change set returned by an operation is the source of
//!   truth; a failed publish is logged, never propagated
//! - **Broadcast semantics**: each subscriber gets a copy of every message

use std::sync::Arc;
use std::sync::mpsc::Receiver;

/// A subscription to an event stream.
///
/// ```ignore
/// let subscription = bus.subscribe();
/// while let Ok(change) = subscription.try_recv() {
///     grid.refresh_field(&change);
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Collect every message that is already queued.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// The trait requires `Send + Sync`, so a bus can be shared by every form
/// handled by an engine.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
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
}

/// Fire-and-forget publishing, object safe.
///
/// Engines hold an `Arc<dyn Publisher<M>>` so they do not depend on the
/// bus's error type. Every `EventBus` is a `Publisher`; failures are logged.
pub trait Publisher<M>: Send + Sync {
    fn publish_lossy(&self, message: M);
}

impl<M, B> Publisher<M> for B
where
    B: EventBus<M>,
{
    fn publish_lossy(&self, message: M) {
        if let Err(err) = self.publish(message) {
            tracing::warn!(error = ?err, "failed to publish change notification");
        }
    }
}
