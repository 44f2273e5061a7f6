//! Client state and registry management.
//!
//! The registry is a lock-free DashMap keyed by client id. Each client owns
//! its subscription table behind an async mutex; only the subscription
//! router and the teardown coordinator take that lock.

use crate::error::{GatewayError, Result};
use crate::protocol::ErrorFrame;
use crate::topic::Topic;
use axum::extract::ws::Message;
use chrono::Utc;
use dashmap::DashMap;
use nats_client::BusSubscription;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Unique client identifier.
pub type ClientId = Uuid;

/// One active (client, topic) pairing.
pub struct Bridge {
    /// Stops the relay. Child of the client's stop token.
    pub stop: CancellationToken,
    /// Upstream subscription feeding the relay channel.
    pub subscription: Box<dyn BusSubscription>,
    /// Relay task copying upstream payloads into the outbound queue.
    pub relay: JoinHandle<()>,
}

/// Topic → bridge table for one client.
#[derive(Default)]
pub struct SubscriptionTable {
    bridges: HashMap<Topic, Bridge>,
    closed: bool,
}

impl SubscriptionTable {
    /// Set once teardown has reclaimed the table.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        self.bridges.contains_key(topic)
    }

    pub fn insert(&mut self, topic: Topic, bridge: Bridge) {
        self.bridges.insert(topic, bridge);
    }

    pub fn remove(&mut self, topic: &Topic) -> Option<Bridge> {
        self.bridges.remove(topic)
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    /// Mark the table closed and hand back every bridge.
    ///
    /// Returns `None` if the table was already closed.
    pub fn close(&mut self) -> Option<Vec<(Topic, Bridge)>> {
        if self.closed {
            return None;
        }
        self.closed = true;
        Some(self.bridges.drain().collect())
    }
}

/// State for a single connected client.
pub struct ClientState {
    /// Unique client identifier.
    pub id: ClientId,
    /// Timestamp when client connected (epoch millis).
    pub connected_at: i64,
    /// Timestamp of the last inbound frame (epoch millis).
    last_activity: AtomicI64,
    /// Sender side of the outbound queue drained by the write pump.
    /// Taken exactly once when the client is closed.
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    /// Fires when the whole client is being torn down.
    stop: CancellationToken,
    /// Current bridges.
    subscriptions: tokio::sync::Mutex<SubscriptionTable>,
}

impl ClientState {
    /// Create a new client state around its outbound queue.
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            connected_at: now,
            last_activity: AtomicI64::new(now),
            outbound: Mutex::new(Some(tx)),
            stop: CancellationToken::new(),
            subscriptions: tokio::sync::Mutex::new(SubscriptionTable::default()),
        }
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Milliseconds since the last inbound frame.
    pub fn idle_millis(&self) -> i64 {
        Utc::now().timestamp_millis() - self.last_activity.load(Ordering::Relaxed)
    }

    /// Client-wide stop signal.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Clone of the outbound sender, or `None` once the client is closed.
    pub fn outbound(&self) -> Option<mpsc::Sender<Message>> {
        self.outbound_slot().clone()
    }

    /// Queue a frame without waiting. Returns false if the queue is full or closed.
    pub fn try_send(&self, msg: Message) -> bool {
        match self.outbound_slot().as_ref() {
            Some(tx) => tx.try_send(msg).is_ok(),
            None => false,
        }
    }

    /// Queue an error frame for this client.
    pub fn send_error(&self, err: &GatewayError) -> Result<()> {
        let frame = ErrorFrame::from(err);
        if self.try_send(Message::Text(frame.to_json().into())) {
            Ok(())
        } else {
            warn!("Outbound queue for {} full or closed, error frame dropped", self.id);
            Err(GatewayError::ChannelSend)
        }
    }

    /// Fire the stop signal and close the outbound queue.
    ///
    /// Returns true only for the call that actually closed the queue.
    pub fn close(&self) -> bool {
        self.stop.cancel();
        self.outbound_slot().take().is_some()
    }

    /// Lock the subscription table.
    pub async fn subscriptions(&self) -> tokio::sync::MutexGuard<'_, SubscriptionTable> {
        self.subscriptions.lock().await
    }

    fn outbound_slot(&self) -> MutexGuard<'_, Option<mpsc::Sender<Message>>> {
        // Guarded data is a plain Option; a poisoned lock still holds a usable value.
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Lock-free registry of connected clients.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ClientState>>,
}

impl ClientRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Register a new client.
    pub fn register(&self, client: Arc<ClientState>) -> ClientId {
        let id = client.id;
        self.clients.insert(id, client);
        info!("Client {} registered", id);
        id
    }

    /// Remove a client. Only the teardown coordinator calls this.
    pub fn remove(&self, client_id: &ClientId) -> Option<Arc<ClientState>> {
        let removed = self.clients.remove(client_id).map(|(_, client)| client);
        if removed.is_some() {
            info!("Client {} unregistered", client_id);
        }
        removed
    }

    /// Get a client by ID.
    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientState>> {
        self.clients.get(client_id).map(|r| r.clone())
    }

    /// Ids of every registered client.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.iter().map(|entry| *entry.key()).collect()
    }

    /// Get the total number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
