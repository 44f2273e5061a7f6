//! Shared helpers for unit tests.

use async_trait::async_trait;
use axum::extract::ws::Message;
use bytes::Bytes;
use nats_client::{BusError, BusSubscription, MemoryBus, MessageBus, PayloadHandler};
use std::time::Duration;
use tokio::sync::mpsc;

/// Poll `cond` until it holds or two seconds pass.
pub async fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Next text frame from an outbound queue, or `None` on timeout/close.
pub async fn recv_text(rx: &mut mpsc::Receiver<Message>) -> Option<String> {
    match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(Message::Text(text))) => Some(text.as_str().to_string()),
        _ => None,
    }
}

/// Bus whose subscriptions never finish unsubscribing.
#[derive(Clone, Default)]
pub struct StuckBus {
    pub inner: MemoryBus,
}

#[async_trait]
impl MessageBus for StuckBus {
    async fn subscribe(
        &self,
        topic: &str,
        handler: PayloadHandler,
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        let inner = self.inner.subscribe(topic, handler).await?;
        Ok(Box::new(StuckSubscription { _inner: inner }))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        self.inner.publish(topic, payload).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

struct StuckSubscription {
    _inner: Box<dyn BusSubscription>,
}

#[async_trait]
impl BusSubscription for StuckSubscription {
    async fn unsubscribe(&mut self) -> Result<(), BusError> {
        std::future::pending().await
    }
}
