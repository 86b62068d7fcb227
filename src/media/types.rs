#![forbid(unsafe_code)]

// Common types and error handling for the media module

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Custom error type for media engine operations
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Router error: {0}")]
    RouterError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Producer error: {0}")]
    ProducerError(String),

    #[error("Consumer error: {0}")]
    ConsumerError(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Media engine is closed")]
    EngineClosed,

    #[cfg(feature = "mediasoup")]
    #[error("Mediasoup error: {0}")]
    MediasoupError(#[from] mediasoup::worker::RequestError),
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Kind of media carried by a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a WebRTC transport as seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Client sends media (publisher side)
    Producer,
    /// Client receives media (viewer side)
    Consumer,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Producer => f.write_str("producer"),
            TransportDirection::Consumer => f.write_str("consumer"),
        }
    }
}

/// Router created for a room
#[derive(Debug, Clone)]
pub struct RouterInfo {
    pub id: String,
    pub rtp_capabilities: Value,
}

/// Transport information for signaling, forwarded verbatim to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Consumer information for signaling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(rename = "type")]
    pub consumer_type: String,
    pub producer_paused: bool,
}

/// Events raised by the media engine on its own initiative.
///
/// The engine never touches room state; the session layer translates each
/// event into the matching map mutation and notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    TransportClosed { transport_id: String },
    ProducerClosed { producer_id: String },
    ConsumerClosed { consumer_id: String },
    /// The engine process is gone; no room can be serviced any more.
    EngineDied { reason: String },
}
