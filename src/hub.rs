//! Hub core.
//!
//! The hub owns every piece of shared state: the client map, the room map,
//! the matchmaking pool, the spare-room list and the disconnect-grace
//! timers. All mutation funnels through the command pipeline: commands are
//! sharded by originating user (room starts by room id) onto a small pool
//! of worker threads, which keeps each connection's commands in receive
//! order. One coarse lock guards the maps and the pool; each room guards
//! its own innards. Lock order is hub first, then room. Outbound frames
//! are copied out and queued only after the hub lock is released.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::client::{Client, PushOutcome, Status};
use crate::error::HubError;
use crate::matchmaker::MatchPool;
use crate::protocol::{Frame, Pos, Role};
use crate::room::Room;
use crate::server::HubConfig;
use crate::store::{GameResult, GameStore, GameType, NewGameRecord, UserProfile};

/// A unit of work for the hub. Every mutation of shared state is one of
/// these, executed to completion by a worker.
#[derive(Debug, Clone)]
pub enum Command {
    Register { user: i64 },
    Unregister { user: i64 },
    Match { user: i64 },
    Move { user: i64, from: Pos, to: Pos },
    Start { room: u64 },
    End { user: i64, winner: Role },
    Join { user: i64, room: u64 },
    Create { user: i64 },
    Pong { user: i64 },
    Disconnect { user: i64, generation: u64 },
    UndoRequest { user: i64 },
    UndoResponse { user: i64, accepted: bool },
    DrawRequest { user: i64 },
    DrawResponse { user: i64, accepted: bool },
    Chat { user: i64, content: String },
    SendTo { user: i64, frame: Frame },
}

impl Command {
    /// Commands from one user land on one shard, so a connection's inbound
    /// stream is processed in receive order.
    fn shard_key(&self) -> u64 {
        match self {
            Command::Start { room } => *room,
            Command::Register { user }
            | Command::Unregister { user }
            | Command::Match { user }
            | Command::Move { user, .. }
            | Command::End { user, .. }
            | Command::Join { user, .. }
            | Command::Create { user }
            | Command::Pong { user }
            | Command::Disconnect { user, .. }
            | Command::UndoRequest { user }
            | Command::UndoResponse { user, .. }
            | Command::DrawRequest { user }
            | Command::DrawResponse { user, .. }
            | Command::Chat { user, .. }
            | Command::SendTo { user, .. } => *user as u64,
        }
    }
}

/// A waiting room visible to the lobby listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpareRoom {
    pub room_id: u64,
    pub owner_id: i64,
    pub owner_name: String,
}

/// Cancellable one-shot used for the reconnect grace period.
#[derive(Clone)]
struct GraceHandle {
    signal: Arc<(Mutex<bool>, Condvar)>,
}

impl GraceHandle {
    fn new() -> Self {
        Self {
            signal: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    fn cancel(&self) {
        let (lock, cvar) = &*self.signal;
        *lock.lock() = true;
        cvar.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        *self.signal.0.lock()
    }

    /// Block until cancelled or the grace period elapses. Returns true if
    /// the timer was cancelled (the user reconnected in time).
    fn wait(&self, grace: Duration) -> bool {
        let (lock, cvar) = &*self.signal;
        let mut cancelled = lock.lock();
        let deadline = Instant::now() + grace;
        while !*cancelled {
            if cvar.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

#[derive(Default)]
struct HubState {
    clients: HashMap<i64, Arc<Client>>,
    rooms: HashMap<u64, Arc<Room>>,
    pool: MatchPool,
    spare: Vec<SpareRoom>,
    grace: HashMap<i64, GraceHandle>,
}

/// Handle returned to the socket service loop for one attached socket.
pub struct SessionHandle {
    pub client: Arc<Client>,
    pub generation: u64,
}

pub struct Hub {
    cfg: HubConfig,
    store: Arc<dyn GameStore>,
    state: Mutex<HubState>,
    shards: Vec<Sender<Command>>,
}

impl Hub {
    /// Create the hub and spin up its worker pool.
    pub fn new(cfg: HubConfig, store: Arc<dyn GameStore>) -> Arc<Self> {
        let workers = cfg.workers.max(1);
        let mut shards = Vec::with_capacity(workers);
        let mut receivers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel();
            shards.push(tx);
            receivers.push(rx);
        }

        let hub = Arc::new(Self {
            cfg,
            store,
            state: Mutex::new(HubState::default()),
            shards,
        });

        for (i, rx) in receivers.into_iter().enumerate() {
            let hub = Arc::clone(&hub);
            thread::Builder::new()
                .name(format!("hub-worker-{i}"))
                .spawn(move || hub.worker_loop(rx))
                .expect("spawn hub worker");
        }
        hub
    }

    pub fn config(&self) -> &HubConfig {
        &self.cfg
    }

    /// Enqueue a command for processing.
    pub fn submit(self: &Arc<Self>, cmd: Command) {
        let shard = (cmd.shard_key() % self.shards.len() as u64) as usize;
        if self.shards[shard].send(cmd).is_err() {
            error!("hub command channel closed");
        }
    }

    /// Route an out-of-band event (friend request, offline chat, friend
    /// challenge) to a connected user. Dropped silently when offline; the
    /// HTTP layer has already persisted the event.
    pub fn push_to_user(self: &Arc<Self>, user: i64, frame: Frame) {
        self.submit(Command::SendTo { user, frame });
    }

    /// Waiting rooms for the lobby listing.
    pub fn spare_rooms(&self) -> Vec<SpareRoom> {
        self.state.lock().spare.clone()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub fn room_count(&self) -> usize {
        self.state.lock().rooms.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().pool.len()
    }

    /// Attach a validated user to the hub: either a fresh registration or a
    /// reattach to an existing connection within the reconnect grace.
    ///
    /// The returned handle carries the socket generation the service loop
    /// must check before touching the outbox; a newer generation means the
    /// user reconnected elsewhere and this socket stands down.
    pub fn open_session(self: &Arc<Self>, user_id: i64) -> SessionHandle {
        let name = match self.store.profile(user_id) {
            Ok(profile) => profile.name,
            Err(e) => {
                warn!(user = user_id, error = %e, "profile lookup failed at connect");
                format!("player-{user_id}")
            }
        };

        let mut deliveries = Vec::new();
        let handle;
        {
            let mut state = self.state.lock();
            if let Some(existing) = state.clients.get(&user_id).cloned() {
                if let Some(timer) = state.grace.remove(&user_id) {
                    timer.cancel();
                }
                existing.set_name(name);
                existing.touch();
                existing.clear_kill();
                let generation = existing.next_socket_gen();

                deliveries.push((
                    existing.clone(),
                    Frame::Normal {
                        message: "connected".into(),
                    },
                ));

                let room = existing
                    .room_id()
                    .and_then(|id| state.rooms.get(&id).cloned())
                    .filter(|room| room.seat_of(user_id).is_some());
                match room {
                    Some(room) => {
                        let snap = room.snapshot(user_id);
                        deliveries.push((
                            existing.clone(),
                            Frame::Sync {
                                history: snap.history,
                                role: snap.role,
                                current_turn: snap.current_turn,
                            },
                        ));
                    }
                    None => {
                        // The room was torn down while the user was away;
                        // clear their local game state with an empty sync.
                        existing.reset_game();
                        deliveries.push((
                            existing.clone(),
                            Frame::Sync {
                                history: Vec::new(),
                                role: Role::None,
                                current_turn: Role::None,
                            },
                        ));
                    }
                }
                info!(user = user_id, "client reconnected");
                handle = SessionHandle {
                    client: existing,
                    generation,
                };
            } else {
                let client = Arc::new(Client::new(user_id, name, self.cfg.outbox_capacity));
                let generation = client.socket_gen();
                state.clients.insert(user_id, client.clone());
                deliveries.push((
                    client.clone(),
                    Frame::Normal {
                        message: "connected".into(),
                    },
                ));
                info!(user = user_id, "client connected");
                handle = SessionHandle { client, generation };
            }
        }
        for (client, frame) in deliveries {
            self.deliver(&client, frame);
        }
        self.submit(Command::Register { user: user_id });
        handle
    }

    fn worker_loop(self: Arc<Self>, rx: Receiver<Command>) {
        while let Ok(cmd) = rx.recv() {
            self.dispatch(cmd);
        }
    }

    fn dispatch(self: &Arc<Self>, cmd: Command) {
        match cmd {
            Command::Register { user } => self.on_register(user),
            Command::Unregister { user } => self.on_unregister(user),
            Command::Match { user } => self.on_match(user),
            Command::Move { user, from, to } => self.on_move(user, from, to),
            Command::Start { room } => self.on_start(room),
            Command::End { user, winner } => self.on_end(user, winner),
            Command::Join { user, room } => self.on_join(user, room),
            Command::Create { user } => self.on_create(user),
            Command::Pong { user } => self.on_pong(user),
            Command::Disconnect { user, generation } => self.on_disconnect(user, generation),
            Command::UndoRequest { user } => self.on_undo_request(user),
            Command::UndoResponse { user, accepted } => self.on_undo_response(user, accepted),
            Command::DrawRequest { user } => self.on_draw_request(user),
            Command::DrawResponse { user, accepted } => self.on_draw_response(user, accepted),
            Command::Chat { user, content } => self.on_chat(user, content),
            Command::SendTo { user, frame } => self.on_send_to(user, frame),
        }
    }

    fn deliver(&self, client: &Arc<Client>, frame: Frame) {
        match client.push(frame) {
            PushOutcome::Queued => {}
            PushOutcome::DroppedOldest => {
                warn!(user = client.id(), "outbox full, shed oldest queued message");
            }
            PushOutcome::DroppedIncoming => {
                warn!(user = client.id(), "outbox full, shed outgoing message");
            }
            PushOutcome::Overflow => {
                warn!(
                    user = client.id(),
                    "outbox overflow on critical message, closing socket"
                );
            }
        }
    }

    fn persist(&self, record: NewGameRecord) {
        if let Err(e) = self.store.record_game(record) {
            error!(error = %e, "failed to persist game record");
        }
    }

    fn profile_or_placeholder(&self, user: i64) -> UserProfile {
        match self.store.profile(user) {
            Ok(profile) => profile,
            Err(e) => {
                warn!(user, error = %e, "profile lookup failed");
                UserProfile::named(format!("player-{user}"))
            }
        }
    }

    /// Tear a room down: game-end to both seats, the one-shot record draft,
    /// seat resets, and removal from the maps. The caller persists the
    /// returned record and routes the frames after unlocking.
    fn finish_room_locked(
        &self,
        state: &mut HubState,
        room_id: u64,
        winner: Role,
    ) -> (Vec<(Arc<Client>, Frame)>, Option<NewGameRecord>) {
        let mut deliveries = Vec::new();
        let Some(room) = state.rooms.remove(&room_id) else {
            return (deliveries, None);
        };
        state.spare.retain(|s| s.room_id != room_id);
        for occupant in room.occupants() {
            if let Some(client) = state.clients.get(&occupant) {
                deliveries.push((client.clone(), Frame::GameEnd { winner }));
                client.reset_game();
            }
        }
        let record = room.take_record().map(|draft| NewGameRecord {
            red_id: draft.red_id,
            black_id: draft.black_id,
            start_time: draft.started_at,
            result: GameResult::from_winner(winner),
            history: draft.history,
            game_type: GameType::Random,
            ai_level: 0,
        });
        info!(room = room_id, winner = winner.as_wire(), "room finished");
        (deliveries, record)
    }

    fn on_register(&self, user: i64) {
        if let Err(e) = self.store.set_online(user, true) {
            warn!(user, error = %e, "failed to set online flag");
        }
        debug!(user, "client registered");
    }

    fn on_unregister(&self, user: i64) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(timer) = state.grace.remove(&user) {
                timer.cancel();
            }
            state.pool.remove(user);
            let Some(client) = state.clients.remove(&user) else {
                return;
            };
            if let Some(room_id) = client.room_id() {
                if let Some(room) = state.rooms.remove(&room_id) {
                    state.spare.retain(|s| s.room_id != room_id);
                    for occupant in room.occupants() {
                        if occupant == user {
                            continue;
                        }
                        if let Some(opp) = state.clients.get(&occupant) {
                            deliveries.push((
                                opp.clone(),
                                Frame::Normal {
                                    message: "opponent left the game".into(),
                                },
                            ));
                            opp.reset_game();
                        }
                    }
                }
            }
            client.reset_game();
        }
        if let Err(e) = self.store.set_online(user, false) {
            warn!(user, error = %e, "failed to clear online flag");
        }
        for (client, frame) in deliveries {
            self.deliver(&client, frame);
        }
        info!(user, "client unregistered");
    }

    fn on_match(self: &Arc<Self>, user: i64) {
        let mut deliveries = Vec::new();
        let mut start_room = None;
        {
            let mut state = self.state.lock();
            let Some(client) = state.clients.get(&user).cloned() else {
                return;
            };
            match client.status() {
                Status::Playing => {
                    deliveries.push((
                        client,
                        Frame::Normal {
                            message: "already in a game".into(),
                        },
                    ));
                }
                Status::Matching => {
                    deliveries.push((
                        client,
                        Frame::Normal {
                            message: "already matching, please wait".into(),
                        },
                    ));
                }
                Status::Online => match state.pool.enqueue(user) {
                    Err(_) => {
                        deliveries.push((
                            client,
                            Frame::Normal {
                                message: "already matching, please wait".into(),
                            },
                        ));
                    }
                    Ok(()) => {
                        client.set_status(Status::Matching);
                        if let Some((a, b)) = state.pool.pop_pair() {
                            let room = Arc::new(Room::new());
                            let room_id = room.id();
                            for id in [a, b] {
                                if let Err(e) = room.join(id) {
                                    error!(user = id, error = %e, "failed to seat matched player");
                                }
                                if let Some(c) = state.clients.get(&id) {
                                    c.set_room(room_id);
                                }
                            }
                            state.rooms.insert(room_id, room);
                            start_room = Some(room_id);
                        } else {
                            deliveries.push((
                                client,
                                Frame::Normal {
                                    message: "matching, please wait".into(),
                                },
                            ));
                        }
                    }
                },
            }
        }
        for (client, frame) in deliveries {
            self.deliver(&client, frame);
        }
        if let Some(room) = start_room {
            self.submit(Command::Start { room });
        }
    }

    fn on_start(&self, room_id: u64) {
        let pair;
        let red_client;
        let black_client;
        {
            let mut state = self.state.lock();
            let Some(room) = state.rooms.get(&room_id).cloned() else {
                warn!(room = room_id, "start for unknown room");
                return;
            };
            pair = match room.start() {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(room = room_id, error = %e, "cannot start game");
                    return;
                }
            };
            red_client = state.clients.get(&pair.red).cloned();
            black_client = state.clients.get(&pair.black).cloned();
            if let Some(client) = &red_client {
                client.start_play(Role::Red, room_id);
            }
            if let Some(client) = &black_client {
                client.start_play(Role::Black, room_id);
            }
            state.spare.retain(|s| s.room_id != room_id);
        }
        // Profile lookups stay outside the hub lock; a failure degrades to
        // a bare name.
        let red_profile = self.profile_or_placeholder(pair.red);
        let black_profile = self.profile_or_placeholder(pair.black);
        if let Some(client) = &red_client {
            self.deliver(
                client,
                Frame::GameStart {
                    role: Role::Red,
                    opponent: black_profile.into(),
                },
            );
        }
        if let Some(client) = &black_client {
            self.deliver(
                client,
                Frame::GameStart {
                    role: Role::Black,
                    opponent: red_profile.into(),
                },
            );
        }
        info!(room = room_id, red = pair.red, black = pair.black, "game started");
    }

    fn on_move(&self, user: i64, from: Pos, to: Pos) {
        let mut deliveries = Vec::new();
        let mut record = None;
        {
            let mut state = self.state.lock();
            let Some(client) = state.clients.get(&user).cloned() else {
                return;
            };
            match client.room_id() {
                None => deliveries.push((
                    client,
                    Frame::Error {
                        message: HubError::NotInGame.to_string(),
                    },
                )),
                Some(room_id) => match state.rooms.get(&room_id).cloned() {
                    None => deliveries.push((
                        client,
                        Frame::Error {
                            message: HubError::room_not_found(room_id).to_string(),
                        },
                    )),
                    Some(room) => match room.apply_move(user, from, to) {
                        Ok(opponent) => {
                            if let Some(opp) = state.clients.get(&opponent) {
                                deliveries.push((opp.clone(), Frame::Move { from, to }));
                            }
                        }
                        Err(HubError::TurnDrift { room: id }) => {
                            error!(room = id, user, "turn token drift, forcing game end");
                            let (d, r) = self.finish_room_locked(&mut state, id, Role::None);
                            deliveries.extend(d);
                            record = r;
                        }
                        Err(e) => deliveries.push((
                            client,
                            Frame::Error {
                                message: e.to_string(),
                            },
                        )),
                    },
                },
            }
        }
        if let Some(record) = record {
            self.persist(record);
        }
        for (client, frame) in deliveries {
            self.deliver(&client, frame);
        }
    }

    fn on_end(&self, user: i64, winner: Role) {
        let mut deliveries = Vec::new();
        let mut record = None;
        {
            let mut state = self.state.lock();
            let Some(client) = state.clients.get(&user).cloned() else {
                return;
            };
            if client.status() != Status::Playing {
                debug!(user, "end ignored, client not playing");
                return;
            }
            let live_room = client
                .room_id()
                .filter(|id| state.rooms.contains_key(id));
            match live_room {
                Some(room_id) => {
                    let (d, r) = self.finish_room_locked(&mut state, room_id, winner);
                    deliveries.extend(d);
                    record = r;
                }
                None => {
                    // Room already gone; still settle the requesting client.
                    client.reset_game();
                    deliveries.push((client, Frame::GameEnd { winner }));
                }
            }
        }
        if let Some(record) = record {
            self.persist(record);
        }
        for (client, frame) in deliveries {
            self.deliver(&client, frame);
        }
    }

    fn on_join(self: &Arc<Self>, user: i64, room_id: u64) {
        let mut deliveries = Vec::new();
        let mut start_room = None;
        {
            let mut state = self.state.lock();
            let Some(client) = state.clients.get(&user).cloned() else {
                return;
            };
            if client.status() == Status::Playing {
                deliveries.push((
                    client,
                    Frame::Normal {
                        message: "already in a game".into(),
                    },
                ));
            } else {
                match state.rooms.get(&room_id).cloned() {
                    None => deliveries.push((
                        client,
                        Frame::Error {
                            message: HubError::room_not_found(room_id).to_string(),
                        },
                    )),
                    Some(room) => match room.join(user) {
                        Ok(_) => {
                            state.pool.remove(user);
                            if client.status() == Status::Matching {
                                client.set_status(Status::Online);
                            }
                            client.set_room(room_id);
                            if room.is_full() {
                                start_room = Some(room_id);
                            }
                        }
                        Err(e) => deliveries.push((
                            client,
                            Frame::Error {
                                message: e.to_string(),
                            },
                        )),
                    },
                }
            }
        }
        for (client, frame) in deliveries {
            self.deliver(&client, frame);
        }
        if let Some(room) = start_room {
            self.submit(Command::Start { room });
        }
    }

    fn on_create(&self, user: i64) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(client) = state.clients.get(&user).cloned() else {
                return;
            };
            if client.status() == Status::Playing {
                deliveries.push((
                    client,
                    Frame::Normal {
                        message: "already in a game".into(),
                    },
                ));
            } else {
                state.pool.remove(user);
                if client.status() == Status::Matching {
                    client.set_status(Status::Online);
                }
                let room = Arc::new(Room::new());
                let room_id = room.id();
                if let Err(e) = room.join(user) {
                    error!(user, error = %e, "failed to seat room creator");
                }
                client.set_room(room_id);
                state.spare.push(SpareRoom {
                    room_id,
                    owner_id: user,
                    owner_name: client.name(),
                });
                state.rooms.insert(room_id, room);
                deliveries.push((client, Frame::RoomCreated { room_id }));
                info!(user, room = room_id, "room created");
            }
        }
        for (client, frame) in deliveries {
            self.deliver(&client, frame);
        }
    }

    fn on_pong(&self, user: i64) {
        if let Some(client) = self.state.lock().clients.get(&user) {
            client.touch();
        }
    }

    fn on_disconnect(self: &Arc<Self>, user: i64, generation: u64) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(client) = state.clients.get(&user).cloned() else {
                return;
            };
            // A reconnect may already have superseded the dead socket; its
            // disconnect must not start a grace timer against the live one.
            if client.socket_gen() != generation {
                debug!(user, "stale disconnect for a replaced socket, ignoring");
                return;
            }
            if let Some(old) = state.grace.remove(&user) {
                old.cancel();
            }
            state.pool.remove(user);

            if let Some(room) = client.room_id().and_then(|id| state.rooms.get(&id).cloned()) {
                if let Some(opp) = room
                    .opponent_of(user)
                    .and_then(|id| state.clients.get(&id).cloned())
                {
                    deliveries.push((
                        opp,
                        Frame::Normal {
                            message: "opponent disconnected, awaiting reconnect".into(),
                        },
                    ));
                }
            }

            let handle = GraceHandle::new();
            state.grace.insert(user, handle.clone());
            let hub = Arc::clone(self);
            let grace = self.cfg.reconnect_grace;
            thread::Builder::new()
                .name(format!("grace-{user}"))
                .spawn(move || {
                    if handle.wait(grace) {
                        return; // reconnected in time
                    }
                    let action = {
                        let mut state = hub.state.lock();
                        // A reconnect may have won the race between the
                        // timeout and this lock.
                        if handle.is_cancelled() {
                            return;
                        }
                        state.grace.remove(&user);
                        state.clients.get(&user).map(|c| (c.status(), c.role()))
                    };
                    match action {
                        Some((Status::Playing, role)) => {
                            hub.submit(Command::End {
                                user,
                                winner: role.opposite(),
                            });
                        }
                        Some(_) => hub.submit(Command::Unregister { user }),
                        None => {}
                    }
                })
                .expect("spawn grace timer");
        }
        for (client, frame) in deliveries {
            self.deliver(&client, frame);
        }
        info!(user, "client disconnected, awaiting reconnect");
    }

    fn on_undo_request(&self, user: i64) {
        let mut deliveries = Vec::new();
        {
            let state = self.state.lock();
            let Some(client) = state.clients.get(&user).cloned() else {
                return;
            };
            match client.room_id().and_then(|id| state.rooms.get(&id).cloned()) {
                None => deliveries.push((
                    client,
                    Frame::Error {
                        message: HubError::NotInGame.to_string(),
                    },
                )),
                Some(room) => match room.request_undo(user) {
                    Ok(opponent) => match state.clients.get(&opponent) {
                        Some(opp) => deliveries.push((opp.clone(), Frame::UndoRequest)),
                        None => deliveries.push((
                            client,
                            Frame::Error {
                                message: HubError::OpponentMissing.to_string(),
                            },
                        )),
                    },
                    Err(e) => deliveries.push((
                        client,
                        Frame::Error {
                            message: e.to_string(),
                        },
                    )),
                },
            }
        }
        for (client, frame) in deliveries {
            self.deliver(&client, frame);
        }
    }

    fn on_undo_response(&self, user: i64, accepted: bool) {
        let mut deliveries = Vec::new();
        {
            let state = self.state.lock();
            let Some(client) = state.clients.get(&user).cloned() else {
                return;
            };
            match client.room_id().and_then(|id| state.rooms.get(&id).cloned()) {
                None => deliveries.push((
                    client,
                    Frame::Error {
                        message: HubError::NotInGame.to_string(),
                    },
                )),
                Some(room) => match room.respond_undo(user, accepted) {
                    Ok(outcome) => {
                        if let Some(requester) = state.clients.get(&outcome.requester) {
                            deliveries
                                .push((requester.clone(), Frame::UndoResponse { accepted }));
                        }
                    }
                    Err(e) => deliveries.push((
                        client,
                        Frame::Error {
                            message: e.to_string(),
                        },
                    )),
                },
            }
        }
        for (client, frame) in deliveries {
            self.deliver(&client, frame);
        }
    }

    fn on_draw_request(&self, user: i64) {
        let mut deliveries = Vec::new();
        {
            let state = self.state.lock();
            let Some(client) = state.clients.get(&user).cloned() else {
                return;
            };
            match client.room_id().and_then(|id| state.rooms.get(&id).cloned()) {
                None => deliveries.push((
                    client,
                    Frame::Error {
                        message: HubError::NotInGame.to_string(),
                    },
                )),
                Some(room) => match room.request_draw(user) {
                    Ok(opponent) => match state.clients.get(&opponent) {
                        Some(opp) => deliveries.push((opp.clone(), Frame::DrawRequest)),
                        None => deliveries.push((
                            client,
                            Frame::Error {
                                message: HubError::OpponentMissing.to_string(),
                            },
                        )),
                    },
                    Err(e) => deliveries.push((
                        client,
                        Frame::Error {
                            message: e.to_string(),
                        },
                    )),
                },
            }
        }
        for (client, frame) in deliveries {
            self.deliver(&client, frame);
        }
    }

    fn on_draw_response(&self, user: i64, accepted: bool) {
        let mut deliveries = Vec::new();
        let mut record = None;
        {
            let mut state = self.state.lock();
            let Some(client) = state.clients.get(&user).cloned() else {
                return;
            };
            match client.room_id().and_then(|id| state.rooms.get(&id).cloned()) {
                None => deliveries.push((
                    client,
                    Frame::Error {
                        message: HubError::NotInGame.to_string(),
                    },
                )),
                Some(room) => match room.respond_draw(user, accepted) {
                    Ok(outcome) => {
                        if let Some(requester) = state.clients.get(&outcome.requester) {
                            deliveries
                                .push((requester.clone(), Frame::DrawResponse { accepted }));
                        }
                        if outcome.accepted {
                            let (d, r) =
                                self.finish_room_locked(&mut state, room.id(), Role::None);
                            deliveries.extend(d);
                            record = r;
                        }
                    }
                    Err(e) => deliveries.push((
                        client,
                        Frame::Error {
                            message: e.to_string(),
                        },
                    )),
                },
            }
        }
        if let Some(record) = record {
            self.persist(record);
        }
        for (client, frame) in deliveries {
            self.deliver(&client, frame);
        }
    }

    fn on_chat(&self, user: i64, content: String) {
        let mut deliveries = Vec::new();
        {
            let state = self.state.lock();
            let Some(client) = state.clients.get(&user).cloned() else {
                return;
            };
            match client.room_id().and_then(|id| state.rooms.get(&id).cloned()) {
                None => deliveries.push((
                    client,
                    Frame::Error {
                        message: HubError::NotInGame.to_string(),
                    },
                )),
                Some(room) => match room
                    .opponent_of(user)
                    .and_then(|id| state.clients.get(&id).cloned())
                {
                    Some(opp) => deliveries.push((
                        opp,
                        Frame::Chat {
                            content,
                            sender: client.name(),
                        },
                    )),
                    None => deliveries.push((
                        client,
                        Frame::Error {
                            message: HubError::OpponentMissing.to_string(),
                        },
                    )),
                },
            }
        }
        for (client, frame) in deliveries {
            self.deliver(&client, frame);
        }
    }

    fn on_send_to(&self, user: i64, frame: Frame) {
        let target = self.state.lock().clients.get(&user).cloned();
        match target {
            Some(client) => self.deliver(&client, frame),
            None => debug!(user, "push target offline, dropping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn wait_for_frame(
        client: &Arc<Client>,
        mut pred: impl FnMut(&Frame) -> bool,
    ) -> Option<Frame> {
        for _ in 0..300 {
            let drained = client.outbox().drain();
            let mut found = None;
            for frame in drained {
                if found.is_none() && pred(&frame) {
                    found = Some(frame);
                } else {
                    client.outbox().push(frame);
                }
            }
            if found.is_some() {
                return found;
            }
            thread::sleep(Duration::from_millis(10));
        }
        None
    }

    fn test_hub(grace: Duration) -> (Arc<Hub>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.upsert_profile(1, UserProfile::named("alice"));
        store.upsert_profile(2, UserProfile::named("bob"));
        let cfg = HubConfig {
            reconnect_grace: grace,
            workers: 2,
            outbox_capacity: 32,
            ..Default::default()
        };
        let hub = Hub::new(cfg, store.clone());
        (hub, store)
    }

    /// Open sessions for users 1 and 2 and pair them, returning the two
    /// client handles with 1 as red and 2 as black.
    fn matched_pair(hub: &Arc<Hub>) -> (Arc<Client>, Arc<Client>) {
        let a = hub.open_session(1);
        let b = hub.open_session(2);
        hub.submit(Command::Match { user: 1 });
        assert!(wait_for(|| hub.queued_count() == 1));
        hub.submit(Command::Match { user: 2 });
        assert!(wait_for(|| {
            a.client.status() == Status::Playing && b.client.status() == Status::Playing
        }));
        (a.client, b.client)
    }

    #[test]
    fn test_match_pairs_and_assigns_roles() {
        let (hub, store) = test_hub(Duration::from_secs(8));
        let (red, black) = matched_pair(&hub);

        assert_eq!(red.role(), Role::Red);
        assert_eq!(black.role(), Role::Black);
        assert_eq!(hub.room_count(), 1);
        assert_eq!(hub.queued_count(), 0);
        assert!(store.is_online(1));

        let start = wait_for_frame(&red, |f| matches!(f, Frame::GameStart { .. })).unwrap();
        match start {
            Frame::GameStart { role, opponent } => {
                assert_eq!(role, Role::Red);
                assert_eq!(opponent.name, "bob");
            }
            _ => unreachable!(),
        }
        assert!(wait_for_frame(&black, |f| matches!(
            f,
            Frame::GameStart { role: Role::Black, .. }
        ))
        .is_some());
    }

    #[test]
    fn test_double_match_guard() {
        let (hub, _) = test_hub(Duration::from_secs(8));
        let session = hub.open_session(1);
        hub.submit(Command::Match { user: 1 });
        hub.submit(Command::Match { user: 1 });
        assert!(wait_for(|| hub.queued_count() == 1));

        let notice = wait_for_frame(&session.client, |f| {
            matches!(f, Frame::Normal { message } if message.contains("already matching"))
        });
        assert!(notice.is_some());
        assert_eq!(hub.queued_count(), 1);
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn test_move_forwarding_and_turn_enforcement() {
        let (hub, _) = test_hub(Duration::from_secs(8));
        let (red, black) = matched_pair(&hub);

        hub.submit(Command::Move {
            user: 1,
            from: Pos::new(0, 3),
            to: Pos::new(0, 4),
        });
        let forwarded = wait_for_frame(&black, |f| matches!(f, Frame::Move { .. })).unwrap();
        assert_eq!(
            forwarded,
            Frame::Move {
                from: Pos::new(0, 3),
                to: Pos::new(0, 4),
            }
        );

        // Red again out of turn.
        hub.submit(Command::Move {
            user: 1,
            from: Pos::new(1, 3),
            to: Pos::new(1, 4),
        });
        let rejection = wait_for_frame(&red, |f| matches!(f, Frame::Error { .. })).unwrap();
        match rejection {
            Frame::Error { message } => assert!(message.contains("not your turn")),
            _ => unreachable!(),
        }

        // Black's move is accepted.
        hub.submit(Command::Move {
            user: 2,
            from: Pos::new(0, 3),
            to: Pos::new(0, 4),
        });
        assert!(wait_for_frame(&red, |f| matches!(f, Frame::Move { .. })).is_some());
    }

    #[test]
    fn test_resign_persists_record_once() {
        let (hub, store) = test_hub(Duration::from_secs(8));
        let (red, black) = matched_pair(&hub);

        hub.submit(Command::Move {
            user: 1,
            from: Pos::new(0, 3),
            to: Pos::new(0, 4),
        });
        assert!(wait_for_frame(&black, |f| matches!(f, Frame::Move { .. })).is_some());

        // Red resigns: black wins.
        hub.submit(Command::End {
            user: 1,
            winner: Role::Black,
        });
        let end = wait_for_frame(&red, |f| matches!(f, Frame::GameEnd { .. })).unwrap();
        assert_eq!(end, Frame::GameEnd { winner: Role::Black });
        assert!(wait_for_frame(&black, |f| matches!(
            f,
            Frame::GameEnd { winner: Role::Black }
        ))
        .is_some());

        assert!(wait_for(|| store.record_count() == 1));
        let record = &store.records()[0];
        assert_eq!(record.result, GameResult::BlackWin);
        assert_eq!(record.history, "0304");
        assert_eq!(record.red_id, 1);
        assert_eq!(record.black_id, 2);

        // A second end (double resign, late timer) must not write again.
        hub.submit(Command::End {
            user: 2,
            winner: Role::Red,
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(store.record_count(), 1);
        assert_eq!(hub.room_count(), 0);
        assert_eq!(red.status(), Status::Online);
        assert_eq!(black.status(), Status::Online);
    }

    #[test]
    fn test_draw_accept_ends_with_no_winner() {
        let (hub, store) = test_hub(Duration::from_secs(8));
        let (red, black) = matched_pair(&hub);

        hub.submit(Command::DrawRequest { user: 1 });
        assert!(wait_for_frame(&black, |f| matches!(f, Frame::DrawRequest)).is_some());

        hub.submit(Command::DrawResponse {
            user: 2,
            accepted: true,
        });
        assert!(wait_for_frame(&red, |f| matches!(
            f,
            Frame::DrawResponse { accepted: true }
        ))
        .is_some());
        assert!(wait_for_frame(&red, |f| matches!(
            f,
            Frame::GameEnd { winner: Role::None }
        ))
        .is_some());
        assert!(wait_for_frame(&black, |f| matches!(
            f,
            Frame::GameEnd { winner: Role::None }
        ))
        .is_some());

        assert!(wait_for(|| store.record_count() == 1));
        assert_eq!(store.records()[0].result, GameResult::Draw);
    }

    #[test]
    fn test_undo_flow() {
        let (hub, _) = test_hub(Duration::from_secs(8));
        let (red, black) = matched_pair(&hub);

        for (user, x) in [(1, 0), (2, 1), (1, 2), (2, 3)] {
            hub.submit(Command::Move {
                user,
                from: Pos::new(x, 3),
                to: Pos::new(x, 4),
            });
            let target = if user == 1 { &black } else { &red };
            assert!(wait_for_frame(target, |f| matches!(f, Frame::Move { .. })).is_some());
        }

        hub.submit(Command::UndoRequest { user: 1 });
        assert!(wait_for_frame(&black, |f| matches!(f, Frame::UndoRequest)).is_some());

        hub.submit(Command::UndoResponse {
            user: 2,
            accepted: true,
        });
        assert!(wait_for_frame(&red, |f| matches!(
            f,
            Frame::UndoResponse { accepted: true }
        ))
        .is_some());

        let state = hub.state.lock();
        let room = state.rooms.values().next().unwrap();
        assert_eq!(room.history_len(), 4);
    }

    #[test]
    fn test_reconnect_within_grace_preserves_game() {
        let (hub, store) = test_hub(Duration::from_secs(5));
        let (red, black) = matched_pair(&hub);
        let old_generation = red.socket_gen();

        hub.submit(Command::Disconnect {
            user: 1,
            generation: old_generation,
        });
        assert!(wait_for_frame(&black, |f| {
            matches!(f, Frame::Normal { message } if message.contains("disconnected"))
        })
        .is_some());

        // Reconnect well inside the grace window.
        let session = hub.open_session(1);
        assert!(Arc::ptr_eq(&session.client, &red), "client object is reused");
        let sync = wait_for_frame(&red, |f| matches!(f, Frame::Sync { .. })).unwrap();
        match sync {
            Frame::Sync { role, current_turn, history } => {
                assert_eq!(role, Role::Red);
                assert_eq!(current_turn, Role::Red);
                assert!(history.is_empty());
            }
            _ => unreachable!(),
        }

        // Game continues, no forfeit was recorded.
        hub.submit(Command::Move {
            user: 1,
            from: Pos::new(0, 3),
            to: Pos::new(0, 4),
        });
        assert!(wait_for_frame(&black, |f| matches!(f, Frame::Move { .. })).is_some());
        assert_eq!(store.record_count(), 0);
        assert_eq!(hub.room_count(), 1);

        // The dead socket's own disconnect may still be in flight; it must
        // not start a grace timer against the live connection.
        hub.submit(Command::Disconnect {
            user: 1,
            generation: old_generation,
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(hub.room_count(), 1);
        assert_eq!(red.status(), Status::Playing);
    }

    #[test]
    fn test_grace_expiry_forfeits_game() {
        let (hub, store) = test_hub(Duration::from_millis(150));
        let (red, black) = matched_pair(&hub);

        hub.submit(Command::Disconnect {
            user: 1,
            generation: red.socket_gen(),
        });
        assert!(wait_for_frame(&black, |f| matches!(
            f,
            Frame::GameEnd { winner: Role::Black }
        ))
        .is_some());
        assert!(wait_for(|| store.record_count() == 1));
        assert_eq!(store.records()[0].result, GameResult::BlackWin);
        assert_eq!(hub.room_count(), 0);

        // A late reconnect finds no game and gets an empty sync.
        let _session = hub.open_session(1);
        let sync = wait_for_frame(&red, |f| matches!(f, Frame::Sync { .. })).unwrap();
        assert_eq!(
            sync,
            Frame::Sync {
                history: vec![],
                role: Role::None,
                current_turn: Role::None,
            }
        );
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn test_disconnect_while_matching_leaves_pool() {
        let (hub, _) = test_hub(Duration::from_millis(100));
        let session = hub.open_session(1);
        hub.submit(Command::Match { user: 1 });
        assert!(wait_for(|| hub.queued_count() == 1));

        hub.submit(Command::Disconnect {
            user: 1,
            generation: session.client.socket_gen(),
        });
        assert!(wait_for(|| hub.queued_count() == 0));
        // Grace expires while idle: the client is unregistered outright.
        assert!(wait_for(|| hub.client_count() == 0));
        drop(session);
    }

    #[test]
    fn test_match_uniqueness_under_concurrency() {
        let store = Arc::new(MemoryStore::new());
        for id in 1..=8 {
            store.upsert_profile(id, UserProfile::named(format!("user-{id}")));
        }
        let cfg = HubConfig {
            workers: 4,
            ..Default::default()
        };
        let hub = Hub::new(cfg, store);

        let sessions: Vec<_> = (1..=8).map(|id| hub.open_session(id)).collect();
        let handles: Vec<_> = (1..=8)
            .map(|id| {
                let hub = Arc::clone(&hub);
                thread::spawn(move || hub.submit(Command::Match { user: id }))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(wait_for(|| hub.room_count() == 4 && hub.queued_count() == 0));
        assert!(wait_for(|| {
            sessions
                .iter()
                .all(|s| s.client.status() == Status::Playing)
        }));

        // Every user sits in exactly one room, and in exactly one seat.
        let state = hub.state.lock();
        let mut seen = std::collections::HashSet::new();
        for room in state.rooms.values() {
            let occupants = room.occupants();
            assert_eq!(occupants.len(), 2);
            for id in occupants {
                assert!(seen.insert(id), "user {id} appears in two rooms");
            }
        }
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn test_chat_forwarded_with_sender_name() {
        let (hub, _) = test_hub(Duration::from_secs(8));
        let (_red, black) = matched_pair(&hub);

        hub.submit(Command::Chat {
            user: 1,
            content: "good luck".into(),
        });
        let chat = wait_for_frame(&black, |f| matches!(f, Frame::Chat { .. })).unwrap();
        assert_eq!(
            chat,
            Frame::Chat {
                content: "good luck".into(),
                sender: "alice".into(),
            }
        );
    }

    #[test]
    fn test_push_bridge_routes_to_connected_user() {
        let (hub, _) = test_hub(Duration::from_secs(8));
        let session = hub.open_session(1);

        let mut data = serde_json::Map::new();
        data.insert("senderName".into(), serde_json::json!("bob"));
        hub.push_to_user(
            1,
            Frame::Push {
                kind: crate::protocol::MessageType::FriendRequest,
                data,
            },
        );
        assert!(wait_for_frame(&session.client, |f| matches!(f, Frame::Push { .. })).is_some());

        // Unknown target: silently dropped.
        hub.push_to_user(99, Frame::Normal { message: "hi".into() });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hub.client_count(), 1);
    }

    #[test]
    fn test_create_and_join_room_flow() {
        let (hub, _) = test_hub(Duration::from_secs(8));
        let owner = hub.open_session(1);
        let guest = hub.open_session(2);

        hub.submit(Command::Create { user: 1 });
        let created =
            wait_for_frame(&owner.client, |f| matches!(f, Frame::RoomCreated { .. })).unwrap();
        let room_id = match created {
            Frame::RoomCreated { room_id } => room_id,
            _ => unreachable!(),
        };
        assert_eq!(hub.spare_rooms().len(), 1);
        assert_eq!(hub.spare_rooms()[0].owner_name, "alice");

        hub.submit(Command::Join {
            user: 2,
            room: room_id,
        });
        assert!(wait_for(|| {
            owner.client.status() == Status::Playing && guest.client.status() == Status::Playing
        }));
        assert!(hub.spare_rooms().is_empty());
        assert_eq!(owner.client.role(), Role::Red);
        assert_eq!(guest.client.role(), Role::Black);
    }

    #[test]
    fn test_join_missing_room() {
        let (hub, _) = test_hub(Duration::from_secs(8));
        let session = hub.open_session(1);
        hub.submit(Command::Join {
            user: 1,
            room: 424242,
        });
        let err = wait_for_frame(&session.client, |f| matches!(f, Frame::Error { .. })).unwrap();
        match err {
            Frame::Error { message } => assert!(message.contains("room not found")),
            _ => unreachable!(),
        }
    }
}
