//! Write pump: the only task that writes to a client's socket.

use crate::client::ClientId;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use metrics::counter;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Drain `rx` into `sink` until the outbound queue closes.
///
/// Each write is bounded by `write_timeout`. A failed or timed out write
/// hands the client to the teardown coordinator and ends the pump. Once the
/// queue closes the pump sends a close frame and returns.
pub async fn run_write_pump<S>(
    client_id: ClientId,
    mut sink: S,
    mut rx: mpsc::Receiver<Message>,
    teardown_tx: mpsc::Sender<ClientId>,
    write_timeout: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(msg) = rx.recv().await {
        let failure = match tokio::time::timeout(write_timeout, sink.send(msg)).await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => format!("write failed: {}", e),
            Err(_) => format!("write timed out after {:?}", write_timeout),
        };

        warn!("Client {} {}", client_id, failure);
        counter!("gateway_write_errors_total").increment(1);
        if teardown_tx.send(client_id).await.is_err() {
            debug!("Teardown coordinator gone, client {} not queued", client_id);
        }
        return;
    }

    // Queue closed by teardown: say goodbye, best effort.
    let _ = tokio::time::timeout(write_timeout, sink.send(Message::Close(None))).await;
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
    debug!("Write pump for {} finished", client_id);
}
