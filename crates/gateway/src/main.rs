//! Gateway service entry point.
//!
//! WebSocket gateway fanning upstream bus topics out to subscribed clients.

use anyhow::Result;
use gateway::{BusBackend, GatewayConfig, GatewayService};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_client::{MemoryBus, MessageBus, NatsClient};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    let config = GatewayConfig::from_env()?;

    info!("Configuration:");
    info!("  WS_PORT: {}", config.ws_port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  BUS_BACKEND: {:?}", config.bus_backend);
    info!("  NATS_URL: {}", config.nats_url);
    info!("  CHANNELS: {}", config.channels.join(","));
    info!("  STREAM_ASSETS: {}", config.assets.join(","));
    info!("  MAX_CONNECTIONS: {}", config.max_connections);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let bus: Arc<dyn MessageBus> = match config.bus_backend {
        BusBackend::Nats => {
            let client = NatsClient::connect(&config.nats_url).await?;
            info!("Connected to NATS");
            Arc::new(client)
        }
        BusBackend::Memory => {
            info!("Using in-memory bus");
            Arc::new(MemoryBus::new())
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.ws_port));
    let service = GatewayService::start(config, bus)?;
    let app = service.app();

    // Start HTTP server
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service.shutdown_token()))
        .await?;

    service.shutdown().await;
    Ok(())
}

/// Resolve on Ctrl+C / SIGTERM and start the gateway's shutdown so open
/// WebSocket connections end and the server can drain.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }

    shutdown.cancel();
}
