//! Load gauges: active connections, active bridges and load pressure.
//!
//! Components never touch the gauges directly. They report through a
//! [`MetricsHandle`], whose narrow channels feed a single [`MetricsReporter`]
//! task. Updates are best effort: a full channel drops the update.

use metrics::gauge;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of each metrics channel.
pub const METRICS_QUEUE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEvent {
    Opened,
    Closed,
}

/// Coarse fan-out cost indicator. Not bounded to 100.
pub fn load_pressure(connections: usize, bridges: usize, extremum: usize) -> f64 {
    if extremum == 0 {
        return 0.0;
    }
    (connections as f64 * bridges as f64) / extremum as f64 * 100.0
}

#[derive(Debug, Default)]
struct GaugeCells {
    connections: AtomicUsize,
    bridges: AtomicUsize,
    load_bits: AtomicU64,
}

/// Point-in-time copy of the gauges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GaugeSnapshot {
    pub connections: usize,
    pub bridges: usize,
    pub load_pressure: f64,
}

/// Cheap, cloneable reporting side of the metrics reporter.
#[derive(Clone)]
pub struct MetricsHandle {
    connection_tx: mpsc::Sender<ConnectionEvent>,
    bridge_tx: mpsc::Sender<i64>,
    gauges: Arc<GaugeCells>,
}

impl MetricsHandle {
    pub fn connection_opened(&self) {
        self.report_connection(ConnectionEvent::Opened);
    }

    pub fn connection_closed(&self) {
        self.report_connection(ConnectionEvent::Closed);
    }

    /// Report a change in the number of active bridges.
    pub fn bridges_changed(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        match self.bridge_tx.try_send(delta) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Dropped bridge metric update ({})", delta),
            Err(TrySendError::Closed(_)) => debug!("Metrics reporter gone, bridge update ignored"),
        }
    }

    /// Latest values published by the reporter.
    pub fn snapshot(&self) -> GaugeSnapshot {
        // Load is stored last with Release; reading it first keeps the counts
        // at least as fresh as the load value.
        let load_pressure = f64::from_bits(self.gauges.load_bits.load(Ordering::Acquire));
        GaugeSnapshot {
            connections: self.gauges.connections.load(Ordering::Relaxed),
            bridges: self.gauges.bridges.load(Ordering::Relaxed),
            load_pressure,
        }
    }

    fn report_connection(&self, event: ConnectionEvent) {
        match self.connection_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Dropped connection metric update ({:?})", event),
            Err(TrySendError::Closed(_)) => debug!("Metrics reporter gone, {:?} ignored", event),
        }
    }
}

/// Single task owning the gauge values.
pub struct MetricsReporter {
    connection_rx: mpsc::Receiver<ConnectionEvent>,
    bridge_rx: mpsc::Receiver<i64>,
    gauges: Arc<GaugeCells>,
    load_extremum: usize,
    connections: usize,
    bridges: usize,
}

/// Create a reporter and its handle.
pub fn metrics_channel(load_extremum: usize) -> (MetricsHandle, MetricsReporter) {
    let (connection_tx, connection_rx) = mpsc::channel(METRICS_QUEUE_SIZE);
    let (bridge_tx, bridge_rx) = mpsc::channel(METRICS_QUEUE_SIZE);
    let gauges = Arc::new(GaugeCells::default());

    let handle = MetricsHandle {
        connection_tx,
        bridge_tx,
        gauges: gauges.clone(),
    };
    let reporter = MetricsReporter {
        connection_rx,
        bridge_rx,
        gauges,
        load_extremum,
        connections: 0,
        bridges: 0,
    };
    (handle, reporter)
}

impl MetricsReporter {
    /// Run until shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("MetricsReporter running");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("MetricsReporter received shutdown signal");
                    break;
                }

                Some(event) = self.connection_rx.recv() => {
                    self.connections = match event {
                        ConnectionEvent::Opened => self.connections + 1,
                        ConnectionEvent::Closed => self.connections.saturating_sub(1),
                    };
                    self.publish();
                }

                Some(delta) = self.bridge_rx.recv() => {
                    self.bridges = (self.bridges as i64 + delta).max(0) as usize;
                    self.publish();
                }

                else => break,
            }
        }

        info!("MetricsReporter stopped");
    }

    fn publish(&self) {
        let load = load_pressure(self.connections, self.bridges, self.load_extremum);

        gauge!("gateway_active_connections").set(self.connections as f64);
        gauge!("gateway_active_bridges").set(self.bridges as f64);
        gauge!("gateway_load_pressure").set(load);

        self.gauges
            .connections
            .store(self.connections, Ordering::Relaxed);
        self.gauges.bridges.store(self.bridges, Ordering::Relaxed);
        self.gauges.load_bits.store(load.to_bits(), Ordering::Release);

        debug!(
            "Gauges: connections={} bridges={} load={:.2}",
            self.connections, self.bridges, load
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_for(
        handle: &MetricsHandle,
        want: impl Fn(&GaugeSnapshot) -> bool,
    ) -> GaugeSnapshot {
        for _ in 0..200 {
            let snapshot = handle.snapshot();
            if want(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.snapshot()
    }

    #[test]
    fn test_load_pressure_is_not_capped() {
        // max_connections = 10 → extremum 20; 5 clients with 2 bridges each.
        assert_eq!(load_pressure(5, 10, 20), 250.0);
        assert_eq!(load_pressure(0, 10, 20), 0.0);
        assert_eq!(load_pressure(5, 10, 0), 0.0);
    }

    #[tokio::test]
    async fn test_reporter_tracks_connections_and_bridges() {
        let (handle, reporter) = metrics_channel(20);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reporter.run(shutdown.clone()));

        for _ in 0..5 {
            handle.connection_opened();
        }
        for _ in 0..5 {
            handle.bridges_changed(2);
        }

        let snapshot = wait_for(&handle, |s| s.load_pressure == 250.0).await;
        assert_eq!(snapshot.connections, 5);
        assert_eq!(snapshot.bridges, 10);
        assert_eq!(snapshot.load_pressure, 250.0);

        handle.bridges_changed(-10);
        handle.connection_closed();
        let snapshot = wait_for(&handle, |s| s.bridges == 0 && s.connections == 4).await;
        assert_eq!(snapshot.bridges, 0);
        assert_eq!(snapshot.connections, 4);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_bridges_never_go_negative() {
        let (handle, reporter) = metrics_channel(20);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reporter.run(shutdown.clone()));

        handle.bridges_changed(1);
        let snapshot = wait_for(&handle, |s| s.bridges == 1).await;
        assert_eq!(snapshot.bridges, 1);

        // Clamped at zero, so the final +2 lands on 2 rather than 0.
        handle.bridges_changed(-3);
        handle.bridges_changed(2);
        let snapshot = wait_for(&handle, |s| s.bridges == 2).await;
        assert_eq!(snapshot.bridges, 2);

        shutdown.cancel();
        task.await.unwrap();
    }
}
