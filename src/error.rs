//! Error types for the session hub.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HubError>;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("unknown message type: {0}")]
    UnknownMessageType(u64),

    #[error("not in a game")]
    NotInGame,

    #[error("not your turn")]
    NotYourTurn,

    #[error("room full: {id}")]
    RoomFull { id: u64 },

    #[error("room not found: {id}")]
    RoomNotFound { id: u64 },

    #[error("opponent missing")]
    OpponentMissing,

    #[error("already in the match queue")]
    AlreadyMatching,

    #[error("already in a game")]
    AlreadyPlaying,

    #[error("no pending request to respond to")]
    NoPendingRequest,

    #[error("turn token drift in room {room}")]
    TurnDrift { room: u64 },
}

impl HubError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub fn room_full(id: u64) -> Self {
        Self::RoomFull { id }
    }

    pub fn room_not_found(id: u64) -> Self {
        Self::RoomNotFound { id }
    }

    /// Non-fatal game-state errors are answered with an `error` frame and the
    /// connection stays up; everything else tears the socket down.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Self::NotInGame
                | Self::NotYourTurn
                | Self::RoomFull { .. }
                | Self::RoomNotFound { .. }
                | Self::OpponentMissing
                | Self::AlreadyMatching
                | Self::AlreadyPlaying
                | Self::NoPendingRequest
        )
    }
}
