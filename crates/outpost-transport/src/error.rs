//! Transport and channel errors

use outpost_proto::{ChannelId, CodecError};
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(e.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Channel registry errors
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("connection id already exists")]
    AlreadyOpen(ChannelId),
}
