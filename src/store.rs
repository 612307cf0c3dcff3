//! Persistence adapter.
//!
//! The hub talks to storage through the narrow [`GameStore`] trait: one
//! game-record write per finished room, online-flag updates, and profile
//! lookups for the game-start frame. Implementations are expected to
//! tolerate transient failure; the hub logs store errors and keeps going.
//!
//! [`MemoryStore`] is the in-process reference implementation used by the
//! test suite; a relational backend lives outside this crate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::Role;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("user not found: {0}")]
    UserNotFound(i64),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Game outcome as persisted (distinct from the wire `winner` encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum GameResult {
    RedWin = 0,
    BlackWin = 1,
    Draw = 2,
}

impl GameResult {
    pub fn from_winner(winner: Role) -> Self {
        match winner {
            Role::Red => GameResult::RedWin,
            Role::Black => GameResult::BlackWin,
            Role::None => GameResult::Draw,
        }
    }
}

/// How the game came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum GameType {
    Random = 0,
    VsAi = 1,
    Friend = 2,
}

/// A game record to be written. A user id of 0 means AI or an unseated
/// side; `ai_level` (1..=6) is meaningful only for [`GameType::VsAi`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewGameRecord {
    pub red_id: i64,
    pub black_id: i64,
    pub start_time: SystemTime,
    pub result: GameResult,
    pub history: String,
    pub game_type: GameType,
    pub ai_level: u8,
}

/// A persisted game record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: u64,
    pub red_id: i64,
    pub black_id: i64,
    pub start_time: SystemTime,
    pub result: GameResult,
    pub history: String,
    pub game_type: GameType,
    pub ai_level: u8,
}

/// Display profile served to opponents at game start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub name: String,
    pub avatar: String,
    pub exp: i64,
    pub total_games: u32,
    pub win_rate: f32,
}

impl UserProfile {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl From<UserProfile> for crate::protocol::OpponentProfile {
    fn from(profile: UserProfile) -> Self {
        Self {
            name: profile.name,
            avatar: profile.avatar,
            exp: profile.exp,
            total_games: profile.total_games,
            win_rate: profile.win_rate,
        }
    }
}

/// Narrow persistence interface consumed by the hub.
pub trait GameStore: Send + Sync {
    /// Write one finished game. Called at most once per room; the room's
    /// record flag guards idempotence upstream.
    fn record_game(&self, record: NewGameRecord) -> Result<GameRecord>;

    /// Flip a user's online flag on connect/reconnect/unregister.
    fn set_online(&self, user_id: i64, online: bool) -> Result<()>;

    /// Display profile for the game-start frame.
    fn profile(&self, user_id: i64) -> Result<UserProfile>;
}

/// In-memory reference store.
pub struct MemoryStore {
    profiles: DashMap<i64, UserProfile>,
    online: DashMap<i64, bool>,
    records: Mutex<Vec<GameRecord>>,
    next_record_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            profiles: DashMap::new(),
            online: DashMap::new(),
            records: Mutex::new(Vec::new()),
            next_record_id: AtomicU64::new(1),
        }
    }

    pub fn upsert_profile(&self, user_id: i64, profile: UserProfile) {
        self.profiles.insert(user_id, profile);
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.online.get(&user_id).map(|r| *r).unwrap_or(false)
    }

    pub fn records(&self) -> Vec<GameRecord> {
        self.records.lock().clone()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GameStore for MemoryStore {
    fn record_game(&self, record: NewGameRecord) -> Result<GameRecord> {
        let stored = GameRecord {
            id: self.next_record_id.fetch_add(1, Ordering::Relaxed),
            red_id: record.red_id,
            black_id: record.black_id,
            start_time: record.start_time,
            result: record.result,
            history: record.history,
            game_type: record.game_type,
            ai_level: record.ai_level,
        };
        self.records.lock().push(stored.clone());
        Ok(stored)
    }

    fn set_online(&self, user_id: i64, online: bool) -> Result<()> {
        self.online.insert(user_id, online);
        Ok(())
    }

    fn profile(&self, user_id: i64) -> Result<UserProfile> {
        self.profiles
            .get(&user_id)
            .map(|r| r.clone())
            .ok_or(StoreError::UserNotFound(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_ids_are_monotonic() {
        let store = MemoryStore::new();
        let record = NewGameRecord {
            red_id: 1,
            black_id: 2,
            start_time: SystemTime::now(),
            result: GameResult::RedWin,
            history: "0304".into(),
            game_type: GameType::Random,
            ai_level: 0,
        };
        let first = store.record_game(record.clone()).unwrap();
        let second = store.record_game(record).unwrap();
        assert!(second.id > first.id);
        assert_eq!(store.record_count(), 2);
    }

    #[test]
    fn test_online_flag() {
        let store = MemoryStore::new();
        assert!(!store.is_online(1));
        store.set_online(1, true).unwrap();
        assert!(store.is_online(1));
        store.set_online(1, false).unwrap();
        assert!(!store.is_online(1));
    }

    #[test]
    fn test_profile_lookup() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.profile(9),
            Err(StoreError::UserNotFound(9))
        ));
        store.upsert_profile(9, UserProfile::named("alice"));
        assert_eq!(store.profile(9).unwrap().name, "alice");
    }

    #[test]
    fn test_result_from_winner() {
        assert_eq!(GameResult::from_winner(Role::Red), GameResult::RedWin);
        assert_eq!(GameResult::from_winner(Role::Black), GameResult::BlackWin);
        assert_eq!(GameResult::from_winner(Role::None), GameResult::Draw);
    }
}
