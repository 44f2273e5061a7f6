//! Upstream bus access for the stream gateway.
//!
//! - [`MessageBus`]: subscribe/publish seam used by the gateway
//! - [`NatsClient`]: NATS Core implementation
//! - [`MemoryBus`]: in-process implementation for tests and local runs

pub mod bus;
pub mod client;
pub mod memory;

pub use bus::{BusError, BusSubscription, MessageBus, PayloadHandler};
pub use client::{NatsClient, NatsSubscription};
pub use memory::MemoryBus;
