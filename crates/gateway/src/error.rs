//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// JSON serialization/deserialization error.
    #[error("Invalid request format: {0}")]
    Json(#[from] serde_json::Error),

    /// Action other than SUBSCRIBE / UNSUBSCRIBE.
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    /// Topic entry is not a `channel@ASSET` pair.
    #[error("Invalid topic format: {0}")]
    InvalidTopicFormat(String),

    /// `markets` channel with an asset other than DATA / SNAPSHOT.
    #[error("Invalid channel or topic for markets data: {channel}@{asset}")]
    InvalidMarketsTopic { channel: String, asset: String },

    /// Channel or asset outside the allow-lists.
    #[error("Invalid channel or topic name: {channel}@{asset}")]
    InvalidTopic { channel: String, asset: String },

    /// Connection ceiling reached.
    #[error("Too many connections")]
    TooManyConnections,

    /// Channel send error.
    #[error("Channel send error")]
    ChannelSend,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// HTTP-like status code reported in error frames.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Json(_)
            | GatewayError::InvalidAction(_)
            | GatewayError::InvalidTopicFormat(_)
            | GatewayError::InvalidMarketsTopic { .. }
            | GatewayError::InvalidTopic { .. } => 400,
            GatewayError::TooManyConnections => 503,
            _ => 500,
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for GatewayError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        GatewayError::ChannelSend
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
