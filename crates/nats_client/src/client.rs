//! NATS-backed [`MessageBus`] using NATS Core subjects.

use crate::bus::{BusError, BusSubscription, MessageBus, PayloadHandler, Result};
use async_nats::connection::State;
use async_nats::Client;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Wrapper around the NATS client.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect to a NATS server.
    ///
    /// `url` may list several servers separated by commas.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MessageBus for NatsClient {
    /// Subscribe using NATS Core (low-latency push). A dedicated task pulls
    /// messages off the subscriber and hands each payload to `handler`.
    async fn subscribe(
        &self,
        topic: &str,
        handler: PayloadHandler,
    ) -> Result<Box<dyn BusSubscription>> {
        let mut subscriber =
            self.client
                .subscribe(topic.to_string())
                .await
                .map_err(|e| BusError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })?;

        debug!("Subscribed to NATS subject {}", topic);

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task_topic = topic.to_string();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    // Fires on explicit stop and when the handle is dropped.
                    _ = &mut stop_rx => break,

                    msg = subscriber.next() => match msg {
                        Some(msg) => handler(msg.payload),
                        None => {
                            debug!("NATS subscription for {} ended", task_topic);
                            return Ok(());
                        }
                    }
                }
            }

            subscriber
                .unsubscribe()
                .await
                .map_err(|e| BusError::Unsubscribe {
                    topic: task_topic,
                    reason: e.to_string(),
                })
        });

        Ok(Box::new(NatsSubscription {
            topic: topic.to_string(),
            stop_tx: Some(stop_tx),
            task: Some(task),
        }))
    }

    /// Publish using NATS Core (fire-and-forget, lowest latency).
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }
}

/// Live NATS subscription owned by a pump task.
pub struct NatsSubscription {
    topic: String,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

#[async_trait]
impl BusSubscription for NatsSubscription {
    async fn unsubscribe(&mut self) -> Result<()> {
        let Some(stop_tx) = self.stop_tx.take() else {
            return Ok(());
        };
        // The pump may already be gone if the server closed the subscription.
        let _ = stop_tx.send(());

        match self.task.take() {
            Some(task) => task.await.map_err(|e| BusError::Unsubscribe {
                topic: self.topic.clone(),
                reason: e.to_string(),
            })?,
            None => Ok(()),
        }
    }
}
