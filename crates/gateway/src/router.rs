//! Subscription router: the single task that creates and removes bridges.
//!
//! Every SUBSCRIBE / UNSUBSCRIBE command from every connection flows through
//! one queue into [`SubscriptionRouter::run`], so a client's subscription
//! table is never mutated by two commands at once.

use crate::client::{Bridge, ClientState};
use crate::metrics::MetricsHandle;
use crate::protocol::Action;
use crate::relay::spawn_relay;
use crate::topic::Topic;
use bytes::Bytes;
use metrics::counter;
use nats_client::{MessageBus, PayloadHandler};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One validated subscribe/unsubscribe request for a single topic.
#[derive(Clone)]
pub struct SubscriptionCommand {
    pub client: Arc<ClientState>,
    pub action: Action,
    pub topic: Topic,
}

/// Owns the (client, topic) → upstream subscription mapping.
pub struct SubscriptionRouter {
    bus: Arc<dyn MessageBus>,
    metrics: MetricsHandle,
    relay_queue_size: usize,
}

impl SubscriptionRouter {
    pub fn new(bus: Arc<dyn MessageBus>, metrics: MetricsHandle, relay_queue_size: usize) -> Self {
        Self {
            bus,
            metrics,
            relay_queue_size,
        }
    }

    /// Consume commands until shutdown or until every sender is gone.
    pub async fn run(
        self,
        mut commands: mpsc::Receiver<SubscriptionCommand>,
        shutdown: CancellationToken,
    ) {
        info!("SubscriptionRouter running");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("SubscriptionRouter received shutdown signal");
                    break;
                }

                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => {
                        warn!("Subscription command queue closed");
                        break;
                    }
                }
            }
        }

        info!("SubscriptionRouter stopped");
    }

    /// Apply a single command.
    pub async fn handle(&self, cmd: SubscriptionCommand) {
        match cmd.action {
            Action::Subscribe => self.subscribe(&cmd.client, cmd.topic).await,
            Action::Unsubscribe => self.unsubscribe(&cmd.client, &cmd.topic).await,
        }
    }

    async fn subscribe(&self, client: &Arc<ClientState>, topic: Topic) {
        let mut table = client.subscriptions().await;

        if table.is_closed() || client.is_stopped() {
            debug!("Client {} is closing, ignoring subscribe to {}", client.id, topic);
            return;
        }
        if table.contains(&topic) {
            debug!("Client {} already subscribed to {}", client.id, topic);
            return;
        }
        let Some(outbound) = client.outbound() else {
            debug!("Client {} has no outbound queue, ignoring {}", client.id, topic);
            return;
        };

        let (relay_tx, relay_rx) = mpsc::channel::<Bytes>(self.relay_queue_size);
        let client_stop = client.stop_token().clone();
        let stop = client_stop.child_token();

        let handler: PayloadHandler = Arc::new(move |payload: Bytes| {
            if client_stop.is_cancelled() {
                return;
            }
            match relay_tx.try_send(payload) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // Slow consumer: drop rather than stall the upstream delivery.
                    counter!("gateway_messages_dropped_total").increment(1);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        });

        match self.bus.subscribe(&topic.subject(), handler).await {
            Ok(subscription) => {
                let relay = spawn_relay(client.id, topic.clone(), relay_rx, outbound, stop.clone());
                table.insert(
                    topic.clone(),
                    Bridge {
                        stop,
                        subscription,
                        relay,
                    },
                );
                self.metrics.bridges_changed(1);
                counter!("gateway_subscriptions_total").increment(1);
                debug!("Client {} subscribed to {}", client.id, topic);
            }
            Err(e) => {
                warn!(
                    "Upstream subscribe to {} failed for client {}: {}",
                    topic, client.id, e
                );
                counter!("gateway_upstream_errors_total", "op" => "subscribe").increment(1);
            }
        }
    }

    async fn unsubscribe(&self, client: &Arc<ClientState>, topic: &Topic) {
        let mut table = client.subscriptions().await;

        let Some(mut bridge) = table.remove(topic) else {
            debug!("Client {} not subscribed to {}", client.id, topic);
            return;
        };

        // Halt the relay before the upstream side goes away.
        bridge.stop.cancel();
        if let Err(e) = bridge.subscription.unsubscribe().await {
            warn!(
                "Upstream unsubscribe from {} failed for client {}: {}",
                topic, client.id, e
            );
            counter!("gateway_upstream_errors_total", "op" => "unsubscribe").increment(1);
        }
        // Dropping the bridge releases the handler and with it the relay channel.
        drop(bridge);

        self.metrics.bridges_changed(-1);
        debug!("Client {} unsubscribed from {}", client.id, topic);
    }
}
