//! Upstream publish-subscribe seam.
//!
//! The gateway only needs three things from a bus: subscribe a handler to a
//! topic, drop that subscription again, and know whether the connection is
//! healthy. Both the NATS client and the in-process [`MemoryBus`](crate::MemoryBus)
//! implement [`MessageBus`].

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Callback invoked once per upstream message, in arrival order.
pub type PayloadHandler = Arc<dyn Fn(Bytes) + Send + Sync + 'static>;

/// Bus error type.
#[derive(Debug, Error)]
pub enum BusError {
    /// Subscribing to a topic failed.
    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// Unsubscribing from a topic failed.
    #[error("unsubscribe from '{topic}' failed: {reason}")]
    Unsubscribe { topic: String, reason: String },

    /// Publishing to a topic failed.
    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    /// Bus connection is closed.
    #[error("bus connection closed")]
    Closed,
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// A publish-subscribe bus the gateway can fan out from.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Subscribe `handler` to `topic`. The handler is released when the
    /// returned handle is unsubscribed or dropped.
    async fn subscribe(&self, topic: &str, handler: PayloadHandler)
        -> Result<Box<dyn BusSubscription>>;

    /// Publish a raw payload to `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Whether the bus connection is currently usable.
    fn is_connected(&self) -> bool;
}

/// Handle for one live upstream subscription.
#[async_trait]
pub trait BusSubscription: Send + Sync {
    /// Stop delivery and release the handler.
    ///
    /// Calling this on an already-unsubscribed or defunct handle returns `Ok(())`.
    async fn unsubscribe(&mut self) -> Result<()>;
}
