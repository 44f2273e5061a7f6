//! WebSocket server handler using Axum.

use crate::client::{ClientId, ClientRegistry, ClientState};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::metrics::MetricsHandle;
use crate::protocol::{Action, ClientRequest};
use crate::pump::run_write_pump;
use crate::router::SubscriptionCommand;
use crate::topic::TopicNamespace;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use nats_client::MessageBus;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Shared application state.
pub struct AppState {
    pub config: GatewayConfig,
    pub namespace: TopicNamespace,
    pub registry: Arc<ClientRegistry>,
    pub commands: mpsc::Sender<SubscriptionCommand>,
    pub teardown: mpsc::Sender<ClientId>,
    pub metrics: MetricsHandle,
    pub bus: Arc<dyn MessageBus>,
    /// One permit per admitted connection.
    pub connection_slots: Arc<Semaphore>,
    pub shutdown: CancellationToken,
}

/// Body of `/health`.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub clients: usize,
    pub bridges: usize,
    pub load: f64,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/heartbeat", get(heartbeat_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Liveness check: OK while the bus is up and shutdown has not begun.
async fn heartbeat_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.bus.is_connected() && !state.shutdown.is_cancelled() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "ERROR")
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthStatus> {
    let gauges = state.metrics.snapshot();
    Json(HealthStatus {
        status: "ok",
        clients: state.registry.client_count(),
        bridges: gauges.bridges,
        load: gauges.load_pressure,
    })
}

/// WebSocket upgrade handler. Capacity is reserved before the upgrade.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if state.shutdown.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response();
    }

    let permit = match state.connection_slots.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            let err = GatewayError::TooManyConnections;
            warn!("Rejecting connection: {}", err);
            counter!("gateway_connections_rejected_total").increment(1);
            return (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response();
        }
    };

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, permit))
}

/// Handle a WebSocket connection.
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, _slot: OwnedSemaphorePermit) {
    let (tx, rx) = mpsc::channel::<Message>(state.config.outbound_queue_size);

    let Some(client) = admit_client(&state, tx) else {
        debug!("Upgrade completed during shutdown, closing");
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    let client_id = client.id;
    let (ws_tx, mut ws_rx) = socket.split();

    let mut pump = tokio::spawn(run_write_pump(
        client_id,
        ws_tx,
        rx,
        state.teardown.clone(),
        state.config.write_timeout,
    ));

    let inflight = Arc::new(Semaphore::new(state.config.max_inflight_requests));
    let mut requests = JoinSet::new();

    let period = state.config.ping_interval;
    let mut ping_interval = interval_at(Instant::now() + period, period);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let idle_limit = state.config.idle_timeout.as_millis() as i64;

    loop {
        tokio::select! {
            biased;

            _ = state.shutdown.cancelled() => {
                debug!("Closing {} for shutdown", client_id);
                break;
            }

            // Teardown started elsewhere, e.g. by a failed write.
            _ = client.stop_token().cancelled() => break,

            msg = ws_rx.next() => {
                let frame = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", client_id, e);
                        break;
                    }
                    None => break,
                };
                client.touch();

                let keep_open = match frame {
                    Message::Text(text) => {
                        accept_request(&state, &client, &inflight, &mut requests, text.as_bytes()).await
                    }
                    Message::Binary(data) => {
                        accept_request(&state, &client, &inflight, &mut requests, &data).await
                    }
                    // Pongs to client pings are sent by the transport.
                    Message::Ping(_) | Message::Pong(_) => true,
                    Message::Close(_) => false,
                };
                if !keep_open {
                    break;
                }
            }

            Some(joined) = requests.join_next(), if !requests.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!("Request task for {} panicked: {}", client_id, e);
                    }
                }
            }

            _ = ping_interval.tick() => {
                if client.idle_millis() > idle_limit {
                    info!("Client {} idle for over {:?}", client_id, state.config.idle_timeout);
                    break;
                }
                if !client.try_send(Message::Ping(Bytes::new())) {
                    debug!("Outbound queue for {} full, ping skipped", client_id);
                }
            }
        }
    }

    requests.abort_all();

    if state.teardown.send(client_id).await.is_err() {
        // Coordinator already finished; at least let the pump drain and exit.
        debug!("Teardown coordinator gone, closing {} locally", client_id);
        client.close();
    }

    // The pump exits once teardown closes the outbound queue.
    if tokio::time::timeout(state.config.write_timeout, &mut pump)
        .await
        .is_err()
    {
        debug!("Write pump for {} still busy, aborting", client_id);
        pump.abort();
    }

    info!("Client {} disconnected", client_id);
}

/// Register a new client, unless shutdown has begun.
///
/// The coordinator tears down whatever is registered when shutdown fires, so
/// nothing may register after that.
pub fn admit_client(state: &AppState, tx: mpsc::Sender<Message>) -> Option<Arc<ClientState>> {
    if state.shutdown.is_cancelled() {
        return None;
    }

    let client = Arc::new(ClientState::new(tx));
    state.registry.register(client.clone());
    state.metrics.connection_opened();
    counter!("gateway_connections_total").increment(1);

    info!("Client {} connected", client.id);
    Some(client)
}

/// Decode one inbound frame and hand it to a request task.
///
/// Returns false when the connection should be closed.
async fn accept_request(
    state: &Arc<AppState>,
    client: &Arc<ClientState>,
    inflight: &Arc<Semaphore>,
    requests: &mut JoinSet<()>,
    frame: &[u8],
) -> bool {
    let request = match ClientRequest::decode(frame) {
        Ok(request) => request,
        Err(e) => {
            warn!("Undecodable request from {}: {}", client.id, e);
            counter!("gateway_request_errors_total").increment(1);
            let _ = client.send_error(&e);
            return false;
        }
    };

    let Ok(permit) = inflight.clone().acquire_owned().await else {
        return false;
    };

    let state = state.clone();
    let client = client.clone();
    requests.spawn(async move {
        if let Err(e) = dispatch_request(&state, &client, request).await {
            debug!("Rejected request from {}: {}", client.id, e);
            counter!("gateway_request_errors_total").increment(1);
            let _ = client.send_error(&e);
        }
        drop(permit);
    });
    true
}

/// Validate a request and enqueue one command per topic.
///
/// Nothing is enqueued unless the whole request is valid.
async fn dispatch_request(
    state: &AppState,
    client: &Arc<ClientState>,
    request: ClientRequest,
) -> Result<()> {
    let action: Action = request.action.parse()?;
    let topics = state.namespace.expand(&request.topics)?;

    debug!("Client {} {} {:?}", client.id, action, topics);

    for topic in topics {
        state
            .commands
            .send(SubscriptionCommand {
                client: client.clone(),
                action,
                topic,
            })
            .await?;
    }
    Ok(())
}
