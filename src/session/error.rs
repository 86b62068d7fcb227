#![forbid(unsafe_code)]

use crate::media::MediaError;
use thiserror::Error;

/// Request-level failures returned to the calling client
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Participant {participant_id} is not in room {room_id}")]
    ParticipantNotFound {
        room_id: String,
        participant_id: String,
    },

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Cannot consume producer {0} with the given RTP capabilities")]
    IncompatibleCapabilities(String),

    #[error("Media engine error: {0}")]
    MediaEngine(#[from] MediaError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Room {0} is full")]
    RoomFull(String),

    #[error("Room limit reached")]
    TooManyRooms,

    #[error("Media engine is unavailable")]
    EngineUnavailable,
}

impl SessionError {
    /// Stable tag sent to clients in the `error` field
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::RoomNotFound(_) => "RoomNotFound",
            SessionError::ParticipantNotFound { .. } => "ParticipantNotFound",
            SessionError::TransportNotFound(_) => "TransportNotFound",
            SessionError::ProducerNotFound(_) => "ProducerNotFound",
            SessionError::ConsumerNotFound(_) => "ConsumerNotFound",
            SessionError::IncompatibleCapabilities(_) => "IncompatibleCapabilities",
            SessionError::MediaEngine(_) => "MediaEngineError",
            SessionError::InvalidRequest(_) => "InvalidRequest",
            SessionError::RoomFull(_) => "RoomFull",
            SessionError::TooManyRooms => "TooManyRooms",
            SessionError::EngineUnavailable => "EngineUnavailable",
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
