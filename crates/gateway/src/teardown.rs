//! Client teardown.
//!
//! Every disconnect path (read loop exit, write failure, idle timeout,
//! shutdown) ends in one place: [`TeardownCoordinator::teardown`]. The
//! coordinator reclaims the client's bridges, closes its outbound queue,
//! reports the metric deltas and removes it from the registry. Releasing the
//! upstream subscriptions is handed to [`run_unsubscribe_sweep`] so a slow
//! bus never stalls teardown.

use crate::client::{Bridge, ClientId, ClientRegistry};
use crate::metrics::MetricsHandle;
use crate::topic::Topic;
use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bridges reclaimed from one client, waiting for upstream release.
pub struct SweepBatch {
    pub client_id: ClientId,
    pub bridges: Vec<(Topic, Bridge)>,
}

/// Serializes client teardown.
pub struct TeardownCoordinator {
    registry: Arc<ClientRegistry>,
    metrics: MetricsHandle,
    sweep_tx: mpsc::Sender<SweepBatch>,
}

impl TeardownCoordinator {
    pub fn new(
        registry: Arc<ClientRegistry>,
        metrics: MetricsHandle,
        sweep_tx: mpsc::Sender<SweepBatch>,
    ) -> Self {
        Self {
            registry,
            metrics,
            sweep_tx,
        }
    }

    /// Tear down clients as their ids arrive. On shutdown every client still
    /// registered is torn down before returning.
    pub async fn run(self, mut requests: mpsc::Receiver<ClientId>, shutdown: CancellationToken) {
        info!("TeardownCoordinator running");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("TeardownCoordinator received shutdown signal");
                    break;
                }

                request = requests.recv() => match request {
                    Some(client_id) => self.teardown(client_id).await,
                    None => break,
                }
            }
        }

        // Ids queued before shutdown still get torn down; later sends fail
        // and the sender closes the client itself.
        requests.close();
        while let Some(client_id) = requests.recv().await {
            self.teardown(client_id).await;
        }

        let remaining = self.registry.client_ids();
        if !remaining.is_empty() {
            info!("Tearing down {} remaining clients", remaining.len());
        }
        for client_id in remaining {
            self.teardown(client_id).await;
        }

        info!("TeardownCoordinator stopped");
    }

    /// Tear down one client. Unknown or already torn down ids are ignored.
    pub async fn teardown(&self, client_id: ClientId) {
        let Some(client) = self.registry.get(&client_id) else {
            debug!("Client {} already torn down", client_id);
            return;
        };

        // Closing the table under its lock fences off the router: any
        // subscribe it runs after this point sees a closed table.
        let reclaimed = client.subscriptions().await.close();
        let Some(bridges) = reclaimed else {
            debug!("Client {} teardown already in progress", client_id);
            return;
        };

        // Stops every relay (child tokens) and closes the outbound queue so
        // the write pump drains and exits.
        client.close();

        let released = bridges.len();
        if released > 0 {
            self.enqueue_sweep(SweepBatch { client_id, bridges });
            self.metrics.bridges_changed(-(released as i64));
        }
        self.metrics.connection_closed();
        self.registry.remove(&client_id);

        counter!("gateway_disconnections_total").increment(1);
        let connected_for = Utc::now().timestamp_millis() - client.connected_at;
        info!(
            "Client {} torn down after {}ms, {} subscriptions released",
            client_id, connected_for, released
        );
    }

    fn enqueue_sweep(&self, batch: SweepBatch) {
        match self.sweep_tx.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) | Err(TrySendError::Closed(batch)) => {
                warn!(
                    "Sweep queue unavailable, releasing {} subscriptions for {} inline",
                    batch.bridges.len(),
                    batch.client_id
                );
                tokio::spawn(sweep(batch));
            }
        }
    }
}

/// Release upstream subscriptions for reclaimed bridges.
///
/// Once `shutdown` fires, batches still arriving (the coordinator tears down
/// every remaining client) are released until the senders are gone or
/// `drain_timeout` passes, whichever comes first. Whatever is left is dropped.
pub async fn run_unsubscribe_sweep(
    mut batches: mpsc::Receiver<SweepBatch>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) {
    info!("UnsubscribeSweep running");

    loop {
        let batch = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            batch = batches.recv() => match batch {
                Some(batch) => batch,
                None => {
                    info!("UnsubscribeSweep stopped");
                    return;
                }
            },
        };

        let client_id = batch.client_id;
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                warn!("Shutdown interrupted upstream release for {}", client_id);
                break;
            }

            _ = sweep(batch) => {}
        }
    }

    info!("UnsubscribeSweep received shutdown signal, draining");
    let drain = async {
        while let Some(batch) = batches.recv().await {
            sweep(batch).await;
        }
    };
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        warn!(
            "Upstream release did not finish within {:?}, abandoning the rest",
            drain_timeout
        );
    }

    info!("UnsubscribeSweep stopped");
}

async fn sweep(batch: SweepBatch) {
    let SweepBatch { client_id, bridges } = batch;
    let count = bridges.len();

    for (topic, mut bridge) in bridges {
        bridge.stop.cancel();
        if let Err(e) = bridge.subscription.unsubscribe().await {
            warn!(
                "Upstream unsubscribe from {} failed for client {}: {}",
                topic, client_id, e
            );
            counter!("gateway_upstream_errors_total", "op" => "unsubscribe").increment(1);
        }
    }

    debug!("Released {} upstream subscriptions for {}", count, client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientState;
    use crate::metrics::metrics_channel;
    use crate::protocol::Action;
    use crate::router::{SubscriptionCommand, SubscriptionRouter};
    use crate::test_support::{wait_until, StuckBus};
    use axum::extract::ws::Message;
    use nats_client::{MemoryBus, MessageBus};

    struct Fixture {
        bus: MemoryBus,
        registry: Arc<ClientRegistry>,
        metrics: MetricsHandle,
        router: SubscriptionRouter,
        coordinator: TeardownCoordinator,
    }

    impl Fixture {
        /// `sweep_capacity == 0` leaves the sweep task out, closing its queue.
        fn new(sweep_capacity: usize) -> Self {
            let bus = MemoryBus::new();
            let registry = Arc::new(ClientRegistry::new());
            let (metrics, reporter) = metrics_channel(20);
            tokio::spawn(reporter.run(CancellationToken::new()));

            let (sweep_tx, sweep_rx) = mpsc::channel(sweep_capacity.max(1));
            if sweep_capacity > 0 {
                tokio::spawn(run_unsubscribe_sweep(
                    sweep_rx,
                    CancellationToken::new(),
                    Duration::from_secs(1),
                ));
            }

            Self {
                router: SubscriptionRouter::new(Arc::new(bus.clone()), metrics.clone(), 16),
                coordinator: TeardownCoordinator::new(registry.clone(), metrics.clone(), sweep_tx),
                bus,
                registry,
                metrics,
            }
        }

        async fn connect(&self, topics: &[(&str, &str)]) -> (Arc<ClientState>, mpsc::Receiver<Message>) {
            let (tx, rx) = mpsc::channel(32);
            let client = Arc::new(ClientState::new(tx));
            self.registry.register(client.clone());
            self.metrics.connection_opened();

            for (channel, asset) in topics {
                self.router
                    .handle(SubscriptionCommand {
                        client: client.clone(),
                        action: Action::Subscribe,
                        topic: Topic::new(channel, asset),
                    })
                    .await;
            }
            (client, rx)
        }
    }

    #[tokio::test]
    async fn test_teardown_releases_everything() {
        let fx = Fixture::new(8);
        let (client, mut rx) = fx
            .connect(&[("trades", "BTCUSDT"), ("orders", "BTCUSDT")])
            .await;
        assert_eq!(fx.bus.total_subscriptions(), 2);
        assert!(wait_until(|| fx.metrics.snapshot().bridges == 2).await);

        fx.coordinator.teardown(client.id).await;

        assert_eq!(fx.registry.client_count(), 0);
        assert!(client.is_stopped());
        assert!(client.subscriptions().await.is_closed());
        assert!(wait_until(|| fx.bus.total_subscriptions() == 0).await);
        assert!(wait_until(|| {
            let s = fx.metrics.snapshot();
            s.bridges == 0 && s.connections == 0
        })
        .await);

        // Outbound queue is closed, so the write pump would drain and exit.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_teardown_counts_once() {
        let fx = Fixture::new(8);
        let (alice, _alice_rx) = fx.connect(&[("trades", "BTCUSDT")]).await;
        let (_bob, _bob_rx) = fx.connect(&[("trades", "ETHUSDT")]).await;
        assert!(wait_until(|| fx.metrics.snapshot().connections == 2).await);

        fx.coordinator.teardown(alice.id).await;
        fx.coordinator.teardown(alice.id).await;

        assert!(wait_until(|| fx.bus.subscriber_count("trades.BTCUSDT") == 0).await);
        assert!(wait_until(|| fx.metrics.snapshot().bridges == 1).await);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let snapshot = fx.metrics.snapshot();
        assert_eq!(snapshot.connections, 1);
        assert_eq!(snapshot.bridges, 1);
        assert_eq!(fx.bus.subscriber_count("trades.ETHUSDT"), 1);
    }

    #[tokio::test]
    async fn test_subscribe_after_teardown_is_ignored() {
        let fx = Fixture::new(8);
        let (client, _rx) = fx.connect(&[]).await;

        fx.coordinator.teardown(client.id).await;
        fx.router
            .handle(SubscriptionCommand {
                client: client.clone(),
                action: Action::Subscribe,
                topic: Topic::new("trades", "BTCUSDT"),
            })
            .await;

        assert_eq!(fx.bus.total_subscriptions(), 0);
        assert!(client.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_falls_back_when_queue_closed() {
        let fx = Fixture::new(0);
        let (client, _rx) = fx.connect(&[("trades", "BTCUSDT")]).await;
        assert_eq!(fx.bus.total_subscriptions(), 1);

        fx.coordinator.teardown(client.id).await;
        assert!(wait_until(|| fx.bus.total_subscriptions() == 0).await);
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_remaining_clients() {
        let fx = Fixture::new(8);
        let (first, _first_rx) = fx.connect(&[("trades", "BTCUSDT")]).await;
        let (second, _second_rx) = fx.connect(&[("orders", "ETHUSDT")]).await;

        let Fixture {
            bus,
            registry,
            coordinator,
            ..
        } = fx;
        let (_requests_tx, requests_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        coordinator.run(requests_rx, shutdown).await;

        assert_eq!(registry.client_count(), 0);
        assert!(first.is_stopped() && second.is_stopped());
        assert!(wait_until(|| bus.total_subscriptions() == 0).await);
        assert!(bus.is_connected());
    }

    #[tokio::test]
    async fn test_sweep_stops_on_shutdown_when_release_hangs() {
        let bus = StuckBus::default();
        let (metrics, _reporter) = metrics_channel(20);
        let router = SubscriptionRouter::new(Arc::new(bus.clone()), metrics, 4);
        let (tx, _rx) = mpsc::channel(4);
        let client = Arc::new(ClientState::new(tx));
        router
            .handle(SubscriptionCommand {
                client: client.clone(),
                action: Action::Subscribe,
                topic: Topic::new("trades", "BTCUSDT"),
            })
            .await;
        assert_eq!(bus.inner.total_subscriptions(), 1);

        let bridges = client.subscriptions().await.close().unwrap();
        let (sweep_tx, sweep_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let sweeper = tokio::spawn(run_unsubscribe_sweep(
            sweep_rx,
            shutdown.clone(),
            Duration::from_millis(100),
        ));
        sweep_tx
            .send(SweepBatch {
                client_id: client.id,
                bridges,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sweeper.is_finished());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .unwrap()
            .unwrap();
        // Abandoned handles are dropped, which still releases them.
        assert_eq!(bus.inner.total_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_queued_requests_are_handled_after_shutdown() {
        let fx = Fixture::new(8);
        let (client, _rx) = fx.connect(&[("trades", "BTCUSDT")]).await;

        let (requests_tx, requests_rx) = mpsc::channel(4);
        requests_tx.send(client.id).await.unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let Fixture {
            bus,
            registry,
            coordinator,
            ..
        } = fx;
        coordinator.run(requests_rx, shutdown).await;

        assert_eq!(registry.client_count(), 0);
        assert!(client.is_stopped());
        assert!(requests_tx.send(client.id).await.is_err());
        assert!(wait_until(|| bus.total_subscriptions() == 0).await);
    }
}
