//! Per-topic relay: upstream payloads → client outbound queue.

use crate::client::ClientId;
use crate::topic::Topic;
use axum::extract::ws::{Message, Utf8Bytes};
use bytes::Bytes;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Wrap a raw upstream payload as a frame. UTF-8 payloads go out as text.
pub fn payload_frame(payload: Bytes) -> Message {
    match Utf8Bytes::try_from(payload.clone()) {
        Ok(text) => Message::Text(text),
        Err(_) => Message::Binary(payload),
    }
}

/// Spawn the relay for one (client, topic) pair.
///
/// Exits when `stop` fires or the relay channel closes. Payloads are
/// forwarded in arrival order; nothing is forwarded after `stop` fires.
pub fn spawn_relay(
    client_id: ClientId,
    topic: Topic,
    mut relay_rx: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<Message>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let payload = tokio::select! {
                biased;

                _ = stop.cancelled() => break,

                payload = relay_rx.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };

            tokio::select! {
                biased;

                _ = stop.cancelled() => break,

                sent = outbound.send(payload_frame(payload)) => {
                    if sent.is_err() {
                        // Outbound queue closed under us; client is gone.
                        break;
                    }
                    counter!("gateway_messages_relayed_total").increment(1);
                }
            }
        }

        debug!("Relay for {} on {} stopped", client_id, topic);
    })
}
