//! WebSocket subscription gateway in front of an upstream pub/sub bus.
//!
//! This service:
//! - Accepts WebSocket connections and admits up to a configured ceiling
//! - Validates `channel@ASSET` subscription requests against allow-lists
//! - Opens one upstream subscription per (client, topic) pair
//! - Relays upstream payloads verbatim to the subscribed clients
//! - Releases every upstream subscription when a client goes away
//!
//! ## Architecture
//!
//! ```text
//! client frames → read loop → SubscriptionRouter → MessageBus::subscribe
//!                                                        ↓
//!                       write pump ← outbound queue ← relay (per topic)
//!
//! disconnect → TeardownCoordinator → UnsubscribeSweep → upstream unsubscribe
//! ```
//!
//! The router and the teardown coordinator are single tasks fed by bounded
//! queues, so each client's subscription table has at most one writer at a
//! time. Load gauges flow through the [`MetricsReporter`](crate::metrics::MetricsReporter).
//!
//! ## Ordering
//!
//! Requests from the same connection run as independent tasks, bounded by
//! `max_inflight_requests`. Commands from separate requests are therefore not
//! ordered relative to each other; clients that need a SUBSCRIBE to land before
//! a later UNSUBSCRIBE should wait for the first payload. Payload order per
//! (client, topic) is always preserved.

pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod pump;
pub mod relay;
pub mod router;
pub mod service;
pub mod teardown;
pub mod topic;
pub mod ws_server;

#[cfg(test)]
mod test_support;

pub use client::{ClientId, ClientRegistry, ClientState};
pub use config::{BusBackend, GatewayConfig};
pub use error::{GatewayError, Result};
pub use crate::metrics::{GaugeSnapshot, MetricsHandle};
pub use protocol::{Action, ClientRequest, ErrorFrame};
pub use router::{SubscriptionCommand, SubscriptionRouter};
pub use service::GatewayService;
pub use topic::{Topic, TopicNamespace};
pub use ws_server::{create_router, AppState};
