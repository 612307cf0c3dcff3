//! # xiangqi-hub
//!
//! Realtime session hub for an online Chinese-chess (Xiangqi) service.
//!
//! ## Features
//!
//! - **Connections**: per-socket service loops with heartbeat tracking and
//!   bounded outbound queues
//! - **Matchmaking**: strict-FIFO pool that pairs players into rooms
//! - **Rooms**: two-seat game state machines with move history, turn token
//!   and undo/draw negotiation
//! - **Reconnect grace**: a dropped socket keeps its identity for a short
//!   window; reattaching resyncs the game invisibly
//! - **Persistence**: one game record per finished room through a narrow
//!   store trait
//! - **Push bridge**: the HTTP layer routes friend/chat/challenge events to
//!   connected users
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use xiangqi_hub::{HubConfig, HubServer, MemoryStore, TokenAuth};
//!
//! let store = Arc::new(MemoryStore::new());
//! let auth: Arc<dyn TokenAuth> = Arc::new(|token: &str| token.parse().ok());
//! let server = HubServer::bind(HubConfig::default(), store, auth)?;
//! server.run()?;
//! ```

pub mod client;
pub mod error;
pub mod hub;
pub mod matchmaker;
pub mod protocol;
pub mod room;
pub mod server;
pub mod store;
pub mod telemetry;

// Re-exports
pub use client::{Client, Outbox, PushOutcome, Status};
pub use error::{HubError, Result};
pub use hub::{Command, Hub, SessionHandle, SpareRoom};
pub use matchmaker::MatchPool;
pub use protocol::{Frame, MessageType, OpponentProfile, Pos, Role};
pub use room::{Room, RoomPhase, Seat};
pub use server::{HubConfig, HubServer, TokenAuth};
pub use store::{
    GameRecord, GameResult, GameStore, GameType, MemoryStore, NewGameRecord, StoreError,
    UserProfile,
};
pub use telemetry::{init_tracing, TracingConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::Move {
            from: Pos::new(1, 2),
            to: Pos::new(1, 3),
        };
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_room_lifecycle() {
        let room = Room::new();
        room.join(1).unwrap();
        room.join(2).unwrap();
        let pair = room.start().unwrap();
        assert_eq!(pair.red, 1);
        assert_eq!(room.phase(), RoomPhase::InGame);
    }

    #[test]
    fn test_pool_lifecycle() {
        let mut pool = MatchPool::new();
        pool.enqueue(1).unwrap();
        pool.enqueue(2).unwrap();
        assert_eq!(pool.pop_pair(), Some((1, 2)));
        assert!(pool.is_empty());
    }
}
