//! Wires the background tasks and shared state into a running gateway.

use crate::client::ClientRegistry;
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::metrics::metrics_channel;
use crate::router::SubscriptionRouter;
use crate::teardown::{run_unsubscribe_sweep, TeardownCoordinator};
use crate::topic::TopicNamespace;
use crate::ws_server::{create_router, AppState};
use axum::Router;
use nats_client::MessageBus;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Capacity of the upstream unsubscribe sweep queue.
pub const SWEEP_QUEUE_SIZE: usize = 1000;

/// A started gateway: shared state plus its singleton tasks.
pub struct GatewayService {
    state: Arc<AppState>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl GatewayService {
    /// Validate `config` and spawn the router, teardown coordinator,
    /// unsubscribe sweep and metrics reporter.
    pub fn start(config: GatewayConfig, bus: Arc<dyn MessageBus>) -> Result<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let namespace = TopicNamespace::from_config(&config);
        let registry = Arc::new(ClientRegistry::new());
        let (metrics, reporter) = metrics_channel(config.load_extremum);

        let (commands_tx, commands_rx) = mpsc::channel(config.command_queue_size);
        let (teardown_tx, teardown_rx) = mpsc::channel(config.teardown_queue_size);
        let (sweep_tx, sweep_rx) = mpsc::channel(SWEEP_QUEUE_SIZE);

        let router = SubscriptionRouter::new(bus.clone(), metrics.clone(), config.relay_queue_size);
        let coordinator = TeardownCoordinator::new(registry.clone(), metrics.clone(), sweep_tx);

        let tasks = vec![
            ("metrics", tokio::spawn(reporter.run(shutdown.clone()))),
            ("router", tokio::spawn(router.run(commands_rx, shutdown.clone()))),
            (
                "teardown",
                tokio::spawn(coordinator.run(teardown_rx, shutdown.clone())),
            ),
            (
                "sweep",
                tokio::spawn(run_unsubscribe_sweep(
                    sweep_rx,
                    shutdown.clone(),
                    config.shutdown_timeout,
                )),
            ),
        ];

        info!(
            "Gateway started: {} channels, {} assets, max {} connections",
            namespace.channels().len(),
            config.assets.len(),
            config.max_connections
        );

        let state = Arc::new(AppState {
            connection_slots: Arc::new(Semaphore::new(config.max_connections)),
            config,
            namespace,
            registry,
            commands: commands_tx,
            teardown: teardown_tx,
            metrics,
            bus,
            shutdown,
        });

        Ok(Self { state, tasks })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// HTTP/WebSocket routes bound to this gateway.
    pub fn app(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Token cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Signal shutdown and wait for the background tasks to finish.
    ///
    /// Each task gets `shutdown_timeout` after the previous one; a task still
    /// running after that is aborted.
    pub async fn shutdown(self) {
        info!("Shutting down gateway");
        self.state.shutdown.cancel();

        let deadline = self.state.config.shutdown_timeout;
        for (name, mut task) in self.tasks {
            match tokio::time::timeout(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{} task ended abnormally: {}", name, e),
                Err(_) => {
                    warn!("{} task still running after {:?}, aborting", name, deadline);
                    task.abort();
                }
            }
        }

        info!("Gateway stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientState;
    use crate::error::GatewayError;
    use crate::protocol::Action;
    use crate::router::SubscriptionCommand;
    use crate::test_support::{wait_until, StuckBus};
    use crate::topic::Topic;
    use nats_client::MemoryBus;
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let result = GatewayService::start(GatewayConfig::default(), Arc::new(MemoryBus::new()));
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_background_tasks() {
        let config = GatewayConfig {
            channels: vec!["trades".into()],
            assets: vec!["BTCUSDT".into()],
            max_connections: 4,
            ..GatewayConfig::default()
        };
        let service = GatewayService::start(config, Arc::new(MemoryBus::new())).unwrap();
        assert_eq!(service.state().connection_slots.available_permits(), 4);

        let token = service.shutdown_token();
        tokio::time::timeout(Duration::from_secs(2), service.shutdown())
            .await
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded_when_upstream_release_hangs() {
        let bus = StuckBus::default();
        let config = GatewayConfig {
            channels: vec!["trades".into()],
            assets: vec!["BTCUSDT".into()],
            shutdown_timeout: Duration::from_millis(200),
            ..GatewayConfig::default()
        };
        let service = GatewayService::start(config, Arc::new(bus.clone())).unwrap();
        let state = service.state().clone();

        let (tx, _rx) = mpsc::channel(8);
        let client = Arc::new(ClientState::new(tx));
        state.registry.register(client.clone());
        state
            .commands
            .send(SubscriptionCommand {
                client: client.clone(),
                action: Action::Subscribe,
                topic: Topic::new("trades", "BTCUSDT"),
            })
            .await
            .unwrap();
        assert!(wait_until(|| bus.inner.total_subscriptions() == 1).await);

        tokio::time::timeout(Duration::from_secs(3), service.shutdown())
            .await
            .unwrap();

        assert_eq!(state.registry.client_count(), 0);
        assert!(client.is_stopped());
        assert!(wait_until(|| bus.inner.total_subscriptions() == 0).await);
    }
}
