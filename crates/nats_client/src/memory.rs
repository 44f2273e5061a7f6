//! In-process [`MessageBus`] for tests and local runs without a NATS server.
//!
//! Publishing invokes every handler registered for the exact topic
//! synchronously, so delivery order equals publish order.

use crate::bus::{BusError, BusSubscription, MessageBus, PayloadHandler, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct Inner {
    /// Topic → subscription id → handler.
    topics: DashMap<String, HashMap<u64, PayloadHandler>>,
    next_id: AtomicU64,
    disconnected: AtomicBool,
    reject_subscribe: AtomicBool,
}

/// Lock-free in-memory bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    /// Number of live subscriptions across all topics.
    pub fn total_subscriptions(&self) -> usize {
        self.inner.topics.iter().map(|entry| entry.value().len()).sum()
    }

    /// Mark the bus as (dis)connected; disconnected buses refuse subscriptions.
    pub fn set_connected(&self, connected: bool) {
        self.inner.disconnected.store(!connected, Ordering::Relaxed);
    }

    /// Make every subsequent subscribe call fail.
    pub fn reject_subscriptions(&self, reject: bool) {
        self.inner.reject_subscribe.store(reject, Ordering::Relaxed);
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn subscribe(
        &self,
        topic: &str,
        handler: PayloadHandler,
    ) -> Result<Box<dyn BusSubscription>> {
        if !self.is_connected() {
            return Err(BusError::Closed);
        }
        if self.inner.reject_subscribe.load(Ordering::Relaxed) {
            return Err(BusError::Subscribe {
                topic: topic.to_string(),
                reason: "subscriptions rejected".to_string(),
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(id, handler);

        debug!("Memory bus subscription {} on {}", id, topic);

        Ok(Box::new(MemorySubscription {
            bus: self.inner.clone(),
            topic: topic.to_string(),
            id,
        }))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(BusError::Closed);
        }

        // Clone handlers out so none run while the shard lock is held.
        let handlers: Vec<PayloadHandler> = match self.inner.topics.get(topic) {
            Some(subs) => subs.values().cloned().collect(),
            None => return Ok(()),
        };

        for handler in handlers {
            handler(payload.clone());
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.inner.disconnected.load(Ordering::Relaxed)
    }
}

struct MemorySubscription {
    bus: Arc<Inner>,
    topic: String,
    id: u64,
}

impl MemorySubscription {
    fn release(&self) {
        let now_empty = match self.bus.topics.get_mut(&self.topic) {
            Some(mut subs) => {
                subs.remove(&self.id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.bus.topics.remove_if(&self.topic, |_, subs| subs.is_empty());
        }
    }
}

#[async_trait]
impl BusSubscription for MemorySubscription {
    async fn unsubscribe(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.release();
    }
}
