//! Gateway configuration sourced from environment variables.

use crate::error::{GatewayError, Result};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_WS_PORT: u16 = 8090;
const DEFAULT_METRICS_PORT: u16 = 9094;
const DEFAULT_NATS_URL: &str = "nats://localhost:4222";
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;
const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60 * 60;
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;
const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 1000;
const DEFAULT_RELAY_QUEUE_SIZE: usize = 256;
const DEFAULT_COMMAND_QUEUE_SIZE: usize = 1000;
const DEFAULT_TEARDOWN_QUEUE_SIZE: usize = 1000;
const DEFAULT_MAX_INFLIGHT_REQUESTS: usize = 16;

/// Which upstream bus implementation to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusBackend {
    Nats,
    Memory,
}

impl FromStr for BusBackend {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nats" => Ok(BusBackend::Nats),
            "memory" => Ok(BusBackend::Memory),
            other => Err(GatewayError::Config(format!(
                "BUS_BACKEND must be 'nats' or 'memory', got '{}'",
                other
            ))),
        }
    }
}

/// Gateway configuration. Immutable for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// WebSocket / HTTP listener port.
    pub ws_port: u16,
    /// Prometheus exporter port.
    pub metrics_port: u16,
    /// Upstream bus implementation.
    pub bus_backend: BusBackend,
    /// NATS server URL(s), comma separated.
    pub nats_url: String,
    /// Allow-listed channel names.
    pub channels: Vec<String>,
    /// Allow-listed asset / stream names.
    pub assets: Vec<String>,
    /// Assets never accepted even if present in `assets`.
    pub ignored_assets: Vec<String>,
    /// Connection ceiling.
    pub max_connections: usize,
    /// Divisor for the load pressure gauge.
    pub load_extremum: usize,
    /// Max inbound frame size in bytes.
    pub max_message_size: usize,
    /// Keepalive ping cadence.
    pub ping_interval: Duration,
    /// Inactivity after which a client is disconnected.
    pub idle_timeout: Duration,
    /// Deadline for writing one frame to a socket.
    pub write_timeout: Duration,
    /// Upper bound on each shutdown step, upstream cleanup included.
    pub shutdown_timeout: Duration,
    /// Per-client outbound queue capacity.
    pub outbound_queue_size: usize,
    /// Per-bridge relay channel capacity.
    pub relay_queue_size: usize,
    /// Subscription command queue capacity.
    pub command_queue_size: usize,
    /// Teardown queue capacity.
    pub teardown_queue_size: usize,
    /// Concurrent in-flight requests per connection.
    pub max_inflight_requests: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ws_port: DEFAULT_WS_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
            bus_backend: BusBackend::Nats,
            nats_url: DEFAULT_NATS_URL.to_string(),
            channels: Vec::new(),
            assets: Vec::new(),
            ignored_assets: Vec::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            load_extremum: DEFAULT_MAX_CONNECTIONS * 2,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_SIZE,
            relay_queue_size: DEFAULT_RELAY_QUEUE_SIZE,
            command_queue_size: DEFAULT_COMMAND_QUEUE_SIZE,
            teardown_queue_size: DEFAULT_TEARDOWN_QUEUE_SIZE,
            max_inflight_requests: DEFAULT_MAX_INFLIGHT_REQUESTS,
        }
    }
}

impl GatewayConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_connections = parse_var(&lookup, "MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;

        let config = Self {
            ws_port: parse_var(&lookup, "WS_PORT", DEFAULT_WS_PORT)?,
            metrics_port: parse_var(&lookup, "METRICS_PORT", DEFAULT_METRICS_PORT)?,
            bus_backend: parse_var(&lookup, "BUS_BACKEND", BusBackend::Nats)?,
            nats_url: lookup("NATS_URL").unwrap_or_else(|| DEFAULT_NATS_URL.to_string()),
            channels: parse_list(lookup("CHANNELS")),
            assets: parse_list(lookup("STREAM_ASSETS")),
            ignored_assets: parse_list(lookup("IGNORED_ASSETS")),
            max_connections,
            load_extremum: parse_var(&lookup, "LOAD_EXTREMUM", max_connections.saturating_mul(2))?,
            max_message_size: parse_var(&lookup, "MAX_MESSAGE_SIZE", DEFAULT_MAX_MESSAGE_SIZE)?,
            ping_interval: Duration::from_secs(parse_var(
                &lookup,
                "PING_INTERVAL_SECS",
                DEFAULT_PING_INTERVAL_SECS,
            )?),
            idle_timeout: Duration::from_secs(parse_var(
                &lookup,
                "IDLE_TIMEOUT_SECS",
                DEFAULT_IDLE_TIMEOUT_SECS,
            )?),
            write_timeout: Duration::from_secs(parse_var(
                &lookup,
                "WRITE_TIMEOUT_SECS",
                DEFAULT_WRITE_TIMEOUT_SECS,
            )?),
            shutdown_timeout: Duration::from_secs(parse_var(
                &lookup,
                "SHUTDOWN_TIMEOUT_SECS",
                DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            )?),
            outbound_queue_size: parse_var(
                &lookup,
                "OUTBOUND_QUEUE_SIZE",
                DEFAULT_OUTBOUND_QUEUE_SIZE,
            )?,
            relay_queue_size: parse_var(&lookup, "RELAY_QUEUE_SIZE", DEFAULT_RELAY_QUEUE_SIZE)?,
            command_queue_size: parse_var(
                &lookup,
                "COMMAND_QUEUE_SIZE",
                DEFAULT_COMMAND_QUEUE_SIZE,
            )?,
            teardown_queue_size: parse_var(
                &lookup,
                "TEARDOWN_QUEUE_SIZE",
                DEFAULT_TEARDOWN_QUEUE_SIZE,
            )?,
            max_inflight_requests: parse_var(
                &lookup,
                "MAX_INFLIGHT_REQUESTS",
                DEFAULT_MAX_INFLIGHT_REQUESTS,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(GatewayError::Config("CHANNELS must not be empty".into()));
        }
        if self.assets.is_empty() {
            return Err(GatewayError::Config("STREAM_ASSETS must not be empty".into()));
        }

        let non_zero = [
            ("MAX_CONNECTIONS", self.max_connections),
            ("LOAD_EXTREMUM", self.load_extremum),
            ("OUTBOUND_QUEUE_SIZE", self.outbound_queue_size),
            ("RELAY_QUEUE_SIZE", self.relay_queue_size),
            ("COMMAND_QUEUE_SIZE", self.command_queue_size),
            ("TEARDOWN_QUEUE_SIZE", self.teardown_queue_size),
            ("MAX_INFLIGHT_REQUESTS", self.max_inflight_requests),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(GatewayError::Config(format!("{} must be greater than 0", name)));
            }
        }

        if self.ping_interval.is_zero() {
            return Err(GatewayError::Config(
                "PING_INTERVAL_SECS must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| GatewayError::Config(format!("{} has an invalid value: '{}'", key, raw))),
        _ => Ok(default),
    }
}

fn parse_list(raw: Option<String>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_with_required_lists() {
        let config = GatewayConfig::from_lookup(lookup_from(&[
            ("CHANNELS", "trades, orders"),
            ("STREAM_ASSETS", "BTCUSDT,ETHUSDT,"),
        ]))
        .unwrap();

        assert_eq!(config.channels, vec!["trades", "orders"]);
        assert_eq!(config.assets, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(config.ws_port, DEFAULT_WS_PORT);
        assert_eq!(config.bus_backend, BusBackend::Nats);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.load_extremum, DEFAULT_MAX_CONNECTIONS * 2);
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_extremum_follows_max_connections() {
        let config = GatewayConfig::from_lookup(lookup_from(&[
            ("CHANNELS", "trades"),
            ("STREAM_ASSETS", "BTCUSDT"),
            ("MAX_CONNECTIONS", "10"),
            ("BUS_BACKEND", "Memory"),
        ]))
        .unwrap();

        assert_eq!(config.max_connections, 10);
        assert_eq!(config.load_extremum, 20);
        assert_eq!(config.bus_backend, BusBackend::Memory);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad_number = GatewayConfig::from_lookup(lookup_from(&[
            ("CHANNELS", "trades"),
            ("STREAM_ASSETS", "BTCUSDT"),
            ("WS_PORT", "not-a-port"),
        ]));
        assert!(matches!(bad_number, Err(GatewayError::Config(_))));

        let missing_channels =
            GatewayConfig::from_lookup(lookup_from(&[("STREAM_ASSETS", "BTCUSDT")]));
        assert!(matches!(missing_channels, Err(GatewayError::Config(_))));

        let zero_queue = GatewayConfig::from_lookup(lookup_from(&[
            ("CHANNELS", "trades"),
            ("STREAM_ASSETS", "BTCUSDT"),
            ("OUTBOUND_QUEUE_SIZE", "0"),
        ]));
        assert!(matches!(zero_queue, Err(GatewayError::Config(_))));
    }
}
