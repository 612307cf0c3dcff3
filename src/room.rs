//! Two-seat game rooms.
//!
//! A room is a small deterministic state machine: two seats, a flattened
//! move history kept in the sender's frame, a turn token and the pending
//! undo/draw negotiation flags. The first seat plays red, the second black.
//! All mutation happens under the room's own lock; callers route the
//! resulting frames after releasing it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::error::{HubError, Result};
use crate::protocol::{Pos, Role};

static NEXT_ROOM_ID: AtomicU64 = AtomicU64::new(1);

/// One of the two positions in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seat {
    First,
    Second,
}

impl Seat {
    pub fn other(self) -> Seat {
        match self {
            Seat::First => Seat::Second,
            Seat::Second => Seat::First,
        }
    }

    /// Role assignment at game start: first seat is red, second is black.
    pub fn role(self) -> Role {
        match self {
            Seat::First => Role::Red,
            Seat::Second => Role::Black,
        }
    }
}

/// Room lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    Waiting,
    InGame,
    Terminal,
}

#[derive(Debug)]
struct RoomInner {
    phase: RoomPhase,
    first: Option<i64>,
    second: Option<i64>,
    history: Vec<Pos>,
    turn: Seat,
    started_at: Option<SystemTime>,
    undo_pending: Option<Seat>,
    draw_pending: Option<Seat>,
    record_taken: bool,
}

/// The red and black user ids handed out when a game starts.
#[derive(Debug, Clone, Copy)]
pub struct StartPair {
    pub red: i64,
    pub black: i64,
}

/// Outcome of a resolved undo or draw negotiation.
#[derive(Debug, Clone, Copy)]
pub struct NegotiationOutcome {
    pub requester: i64,
    pub accepted: bool,
}

/// Snapshot for the sync frame.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub history: Vec<Pos>,
    pub role: Role,
    pub current_turn: Role,
}

/// Everything the persistence adapter needs, extracted exactly once.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub red_id: i64,
    pub black_id: i64,
    pub started_at: SystemTime,
    pub history: String,
}

pub struct Room {
    id: u64,
    inner: Mutex<RoomInner>,
}

impl Room {
    pub fn new() -> Self {
        Self {
            id: NEXT_ROOM_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(RoomInner {
                phase: RoomPhase::Waiting,
                first: None,
                second: None,
                history: Vec::new(),
                turn: Seat::First,
                started_at: None,
                undo_pending: None,
                draw_pending: None,
                record_taken: false,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> RoomPhase {
        self.inner.lock().phase
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        inner.first.is_some() && inner.second.is_some()
    }

    /// User ids currently seated, first seat first.
    pub fn occupants(&self) -> Vec<i64> {
        let inner = self.inner.lock();
        inner.first.iter().chain(inner.second.iter()).copied().collect()
    }

    pub fn seat_of(&self, user: i64) -> Option<Seat> {
        let inner = self.inner.lock();
        seat_of_inner(&inner, user)
    }

    pub fn role_of(&self, user: i64) -> Role {
        match self.seat_of(user) {
            Some(seat) => seat.role(),
            None => Role::None,
        }
    }

    pub fn opponent_of(&self, user: i64) -> Option<i64> {
        let inner = self.inner.lock();
        match seat_of_inner(&inner, user)? {
            Seat::First => inner.second,
            Seat::Second => inner.first,
        }
    }

    /// Take the first empty seat.
    pub fn join(&self, user: i64) -> Result<Seat> {
        let mut inner = self.inner.lock();
        if seat_of_inner(&inner, user).is_some() {
            return Err(HubError::AlreadyPlaying);
        }
        if inner.first.is_none() {
            inner.first = Some(user);
            Ok(Seat::First)
        } else if inner.second.is_none() {
            inner.second = Some(user);
            Ok(Seat::Second)
        } else {
            Err(HubError::room_full(self.id))
        }
    }

    /// Begin the game: both seats required, roles assigned, clock stamped.
    pub fn start(&self) -> Result<StartPair> {
        let mut inner = self.inner.lock();
        if inner.phase != RoomPhase::Waiting {
            return Err(HubError::protocol("room already started"));
        }
        let (red, black) = match (inner.first, inner.second) {
            (Some(red), Some(black)) => (red, black),
            _ => return Err(HubError::OpponentMissing),
        };
        inner.phase = RoomPhase::InGame;
        inner.turn = Seat::First;
        inner.started_at = Some(SystemTime::now());
        Ok(StartPair { red, black })
    }

    /// Apply a move from `user`, flip the turn and clear any pending
    /// negotiation. Returns the opponent to forward the frame to.
    pub fn apply_move(&self, user: i64, from: Pos, to: Pos) -> Result<i64> {
        let mut inner = self.inner.lock();
        if inner.phase != RoomPhase::InGame {
            return Err(HubError::NotInGame);
        }
        let seat = seat_of_inner(&inner, user).ok_or(HubError::NotInGame)?;
        if inner.turn != seat {
            return Err(HubError::NotYourTurn);
        }
        let opponent = match seat {
            Seat::First => inner.second,
            Seat::Second => inner.first,
        }
        .ok_or(HubError::OpponentMissing)?;

        inner.history.push(from);
        inner.history.push(to);
        inner.turn = seat.other();
        inner.undo_pending = None;
        inner.draw_pending = None;

        if !turn_matches_parity(&inner) {
            return Err(HubError::TurnDrift { room: self.id });
        }
        Ok(opponent)
    }

    /// Record an undo proposal from `user`; returns the opponent to notify.
    pub fn request_undo(&self, user: i64) -> Result<i64> {
        let mut inner = self.inner.lock();
        if inner.phase != RoomPhase::InGame {
            return Err(HubError::NotInGame);
        }
        let seat = seat_of_inner(&inner, user).ok_or(HubError::NotInGame)?;
        let opponent = match seat {
            Seat::First => inner.second,
            Seat::Second => inner.first,
        }
        .ok_or(HubError::OpponentMissing)?;
        inner.undo_pending = Some(seat);
        Ok(opponent)
    }

    /// Resolve a pending undo. Only the proposer's opponent may respond.
    ///
    /// Acceptance removes the last full move pair (a lone opening move is
    /// removed alone) and recomputes the turn token from history parity, so
    /// the proposer is to move again and the parity invariant holds.
    pub fn respond_undo(&self, user: i64, accepted: bool) -> Result<NegotiationOutcome> {
        let mut inner = self.inner.lock();
        if inner.phase != RoomPhase::InGame {
            return Err(HubError::NotInGame);
        }
        let seat = seat_of_inner(&inner, user).ok_or(HubError::NotInGame)?;
        let pending = inner.undo_pending.ok_or(HubError::NoPendingRequest)?;
        if pending != seat.other() {
            return Err(HubError::NoPendingRequest);
        }
        let requester = match pending {
            Seat::First => inner.first,
            Seat::Second => inner.second,
        }
        .ok_or(HubError::OpponentMissing)?;

        inner.undo_pending = None;
        if accepted {
            let keep = inner.history.len().saturating_sub(4);
            inner.history.truncate(keep);
            inner.turn = turn_for_history(inner.history.len());
            inner.draw_pending = None;
        }
        Ok(NegotiationOutcome { requester, accepted })
    }

    /// Record a draw proposal from `user`; returns the opponent to notify.
    pub fn request_draw(&self, user: i64) -> Result<i64> {
        let mut inner = self.inner.lock();
        if inner.phase != RoomPhase::InGame {
            return Err(HubError::NotInGame);
        }
        let seat = seat_of_inner(&inner, user).ok_or(HubError::NotInGame)?;
        let opponent = match seat {
            Seat::First => inner.second,
            Seat::Second => inner.first,
        }
        .ok_or(HubError::OpponentMissing)?;
        inner.draw_pending = Some(seat);
        Ok(opponent)
    }

    /// Resolve a pending draw. On acceptance the caller runs the end
    /// pipeline with no winner.
    pub fn respond_draw(&self, user: i64, accepted: bool) -> Result<NegotiationOutcome> {
        let mut inner = self.inner.lock();
        if inner.phase != RoomPhase::InGame {
            return Err(HubError::NotInGame);
        }
        let seat = seat_of_inner(&inner, user).ok_or(HubError::NotInGame)?;
        let pending = inner.draw_pending.ok_or(HubError::NoPendingRequest)?;
        if pending != seat.other() {
            return Err(HubError::NoPendingRequest);
        }
        let requester = match pending {
            Seat::First => inner.first,
            Seat::Second => inner.second,
        }
        .ok_or(HubError::OpponentMissing)?;

        inner.draw_pending = None;
        if accepted {
            inner.undo_pending = None;
        }
        Ok(NegotiationOutcome { requester, accepted })
    }

    /// Snapshot for resync: history as stored, the requester's role and
    /// whose turn it is.
    pub fn snapshot(&self, user: i64) -> RoomSnapshot {
        let inner = self.inner.lock();
        let role = match seat_of_inner(&inner, user) {
            Some(seat) if inner.phase == RoomPhase::InGame => seat.role(),
            _ => Role::None,
        };
        let current_turn = if inner.phase == RoomPhase::InGame {
            inner.turn.role()
        } else {
            Role::None
        };
        RoomSnapshot {
            history: inner.history.clone(),
            role,
            current_turn,
        }
    }

    /// Extract the persistence payload, at most once per room. The room
    /// transitions to terminal either way.
    pub fn take_record(&self) -> Option<RecordDraft> {
        let mut inner = self.inner.lock();
        inner.phase = RoomPhase::Terminal;
        if inner.record_taken {
            return None;
        }
        inner.record_taken = true;
        Some(RecordDraft {
            red_id: inner.first.unwrap_or(0),
            black_id: inner.second.unwrap_or(0),
            started_at: inner.started_at.unwrap_or_else(SystemTime::now),
            history: encode_history(&inner.history),
        })
    }

    /// History in the compact red-frame string form.
    pub fn history_string(&self) -> String {
        encode_history(&self.inner.lock().history)
    }

    #[cfg(test)]
    pub(crate) fn history_len(&self) -> usize {
        self.inner.lock().history.len()
    }

    #[cfg(test)]
    pub(crate) fn current_turn(&self) -> Seat {
        self.inner.lock().turn
    }
}

impl Default for Room {
    fn default() -> Self {
        Self::new()
    }
}

fn seat_of_inner(inner: &RoomInner, user: i64) -> Option<Seat> {
    if inner.first == Some(user) {
        Some(Seat::First)
    } else if inner.second == Some(user) {
        Some(Seat::Second)
    } else {
        None
    }
}

/// Red is to move iff an even number of moves has been played. Each move
/// occupies two history entries.
fn turn_for_history(entries: usize) -> Seat {
    if (entries / 2) % 2 == 0 {
        Seat::First
    } else {
        Seat::Second
    }
}

fn turn_matches_parity(inner: &RoomInner) -> bool {
    inner.turn == turn_for_history(inner.history.len())
}

/// Encode history as a compact decimal string in the red frame. Moves are
/// stored in the sender's frame; the i-th move is black's iff i is odd, and
/// black coordinates are reflected before concatenation.
pub fn encode_history(history: &[Pos]) -> String {
    let mut out = String::with_capacity(history.len() * 2);
    for (i, pair) in history.chunks_exact(2).enumerate() {
        let mover_is_black = i % 2 == 1;
        for pos in pair {
            let p = if mover_is_black { pos.reflected() } else { *pos };
            out.push(char::from(b'0' + p.x));
            out.push(char::from(b'0' + p.y));
        }
    }
    out
}
