//! Client connections and outbound delivery.
//!
//! A [`Client`] is the identity anchor for one user's live connection. The
//! socket itself lives in the server's service loop and is swappable: a
//! reconnect bumps the socket generation and the superseded loop stands
//! down, so everything that references the client (rooms, the match pool,
//! grace timers) survives the swap untouched.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::protocol::{Frame, Role};

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Online,
    Matching,
    Playing,
}

#[derive(Debug, Clone)]
struct ClientState {
    status: Status,
    role: Role,
    room_id: Option<u64>,
}

/// One user's live connection.
pub struct Client {
    id: i64,
    name: Mutex<String>,
    state: Mutex<ClientState>,
    last_pong: Mutex<Instant>,
    outbox: Outbox,
    socket_gen: AtomicU64,
    kill: AtomicBool,
}

impl Client {
    pub fn new(id: i64, name: impl Into<String>, outbox_capacity: usize) -> Self {
        Self {
            id,
            name: Mutex::new(name.into()),
            state: Mutex::new(ClientState {
                status: Status::Online,
                role: Role::None,
                room_id: None,
            }),
            last_pong: Mutex::new(Instant::now()),
            outbox: Outbox::new(outbox_capacity),
            socket_gen: AtomicU64::new(1),
            kill: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = name.into();
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn set_status(&self, status: Status) {
        self.state.lock().status = status;
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn room_id(&self) -> Option<u64> {
        self.state.lock().room_id
    }

    pub fn set_room(&self, room_id: u64) {
        self.state.lock().room_id = Some(room_id);
    }

    /// Enter the playing state with an assigned role.
    pub fn start_play(&self, role: Role, room_id: u64) {
        let mut state = self.state.lock();
        state.status = Status::Playing;
        state.role = role;
        state.room_id = Some(room_id);
    }

    /// Leave any game: status back to online, role and room cleared.
    pub fn reset_game(&self) {
        let mut state = self.state.lock();
        state.status = Status::Online;
        state.role = Role::None;
        state.room_id = None;
    }

    /// Record a heartbeat pong.
    pub fn touch(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    pub fn last_pong(&self) -> Instant {
        *self.last_pong.lock()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Current socket generation. A service loop only acts while its own
    /// generation is current.
    pub fn socket_gen(&self) -> u64 {
        self.socket_gen.load(Ordering::Acquire)
    }

    /// Advance the generation for a freshly attached socket and return it.
    pub fn next_socket_gen(&self) -> u64 {
        self.socket_gen.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn killed(&self) -> bool {
        self.kill.load(Ordering::Acquire)
    }

    pub fn clear_kill(&self) {
        self.kill.store(false, Ordering::Release);
    }

    /// Queue an outbound frame, applying the backpressure policy. Overflow
    /// of a critical frame marks the socket for closing; the client must
    /// reconnect and resync.
    pub fn push(&self, frame: Frame) -> PushOutcome {
        let outcome = self.outbox.push(frame);
        if outcome == PushOutcome::Overflow {
            self.kill.store(true, Ordering::Release);
        }
        outcome
    }
}

/// Result of queueing into a bounded outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the oldest non-critical frame was shed to make room.
    DroppedOldest,
    /// Queue was full of critical frames; the incoming non-critical frame
    /// was shed instead.
    DroppedIncoming,
    /// Queue was full of critical frames and the incoming frame was also
    /// critical. The socket has to go.
    Overflow,
}

/// Bounded outbound queue, drained by the connection's service loop.
pub struct Outbox {
    queue: Mutex<VecDeque<Frame>>,
    capacity: usize,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    pub fn push(&self, frame: Frame) -> PushOutcome {
        let mut queue = self.queue.lock();
        if queue.len() < self.capacity {
            queue.push_back(frame);
            return PushOutcome::Queued;
        }
        if let Some(idx) = queue.iter().position(|f| !f.is_critical()) {
            let _ = queue.remove(idx);
            queue.push_back(frame);
            return PushOutcome::DroppedOldest;
        }
        if !frame.is_critical() {
            return PushOutcome::DroppedIncoming;
        }
        PushOutcome::Overflow
    }

    pub fn drain(&self) -> Vec<Frame> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Pos;

    fn chat() -> Frame {
        Frame::Chat {
            content: "hello".into(),
            sender: "a".into(),
        }
    }

    fn mv() -> Frame {
        Frame::Move {
            from: Pos::new(0, 0),
            to: Pos::new(0, 1),
        }
    }

    #[test]
    fn test_outbox_fifo() {
        let outbox = Outbox::new(4);
        outbox.push(Frame::Normal { message: "a".into() });
        outbox.push(Frame::Normal { message: "b".into() });
        let drained = outbox.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0], Frame::Normal { message: "a".into() });
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_outbox_sheds_oldest_noncritical_first() {
        let outbox = Outbox::new(2);
        assert_eq!(outbox.push(chat()), PushOutcome::Queued);
        assert_eq!(outbox.push(mv()), PushOutcome::Queued);
        // Full. A critical frame evicts the chat, not the move.
        assert_eq!(outbox.push(mv()), PushOutcome::DroppedOldest);
        let drained = outbox.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(Frame::is_critical));
    }

    #[test]
    fn test_outbox_drops_incoming_noncritical_when_full_of_critical() {
        let outbox = Outbox::new(2);
        outbox.push(mv());
        outbox.push(mv());
        assert_eq!(outbox.push(chat()), PushOutcome::DroppedIncoming);
        assert_eq!(outbox.len(), 2);
    }

    #[test]
    fn test_critical_overflow_kills_socket() {
        let client = Client::new(1, "alice", 2);
        client.push(mv());
        client.push(mv());
        assert!(!client.killed());
        assert_eq!(client.push(mv()), PushOutcome::Overflow);
        assert!(client.killed());
    }

    #[test]
    fn test_socket_generation() {
        let client = Client::new(1, "alice", 8);
        let first = client.socket_gen();
        let second = client.next_socket_gen();
        assert_eq!(second, first + 1);
        assert_eq!(client.socket_gen(), second);
    }

    #[test]
    fn test_play_and_reset() {
        let client = Client::new(7, "bob", 8);
        assert_eq!(client.status(), Status::Online);
        client.start_play(Role::Black, 3);
        assert_eq!(client.status(), Status::Playing);
        assert_eq!(client.role(), Role::Black);
        assert_eq!(client.room_id(), Some(3));
        client.reset_game();
        assert_eq!(client.status(), Status::Online);
        assert_eq!(client.role(), Role::None);
        assert_eq!(client.room_id(), None);
    }
}
