//! WebSocket protocol message types.
//!
//! Clients send one JSON request per frame:
//!
//! ```json
//! {"action": "SUBSCRIBE", "topics": "trades@BTCUSDT,orders@BTCUSDT"}
//! ```
//!
//! The server answers with raw upstream payloads or with an [`ErrorFrame`].

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Request sent from client to server.
///
/// Requests from one connection are handled concurrently, so two requests
/// sent back to back (a SUBSCRIBE followed at once by an UNSUBSCRIBE of the
/// same topic) may reach the router in either order. Within one request the
/// topics are enqueued in order, and payloads for a given topic always arrive
/// in publish order.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    /// `SUBSCRIBE` or `UNSUBSCRIBE`, any case.
    pub action: String,
    /// Comma separated `channel@ASSET` pairs.
    pub topics: String,
}

impl ClientRequest {
    /// Decode a request frame. Newlines are folded into spaces and the frame
    /// is trimmed before parsing.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(frame).replace('\n', " ");
        Ok(serde_json::from_str(text.trim())?)
    }
}

/// Subscription action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Subscribe,
    Unsubscribe,
}

impl FromStr for Action {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUBSCRIBE" => Ok(Action::Subscribe),
            "UNSUBSCRIBE" => Ok(Action::Unsubscribe),
            _ => Err(GatewayError::InvalidAction(s.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Subscribe => f.write_str("SUBSCRIBE"),
            Action::Unsubscribe => f.write_str("UNSUBSCRIBE"),
        }
    }
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Error frame sent to a client whose request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// HTTP-like status code.
    pub code: u16,
    /// Human readable reason.
    pub message: String,
}

impl ErrorFrame {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> String {
        // Two plain fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"message":"internal error"}}"#, self.code)
        })
    }
}

impl From<&GatewayError> for ErrorFrame {
    fn from(err: &GatewayError) -> Self {
        ErrorFrame::new(err.status_code(), err.to_string())
    }
}
