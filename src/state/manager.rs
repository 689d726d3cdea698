//! Room manager.
//!
//! # Locking
//!
//! ```text
//! rooms: RwLock<HashMap<code, Arc<RoomSlot>>>     (held only for lookup/insert/remove)
//!          │
//!          ▼
//! RoomSlot ─ state: Mutex<Room>      one writer per room; never held during I/O
//!          └ delivery: Mutex<()>     serializes outbox draining so clients see
//!                                    messages in commit order
//! ```
//!
//! Every operation locks one room, mutates it, captures a snapshot,
//! releases the lock, then delivers the room's outbox and persists.
//! Rooms never lock each other, so different rooms proceed in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};

use super::game::{GameState, GameView};
use super::player::{Player, PlayerId};
use super::rng::GameRng;
use super::room::{Room, RoomSummary};
use super::settings::GameSettings;
use crate::config::ServerConfig;
use crate::error::{ActionError, InternalConsistencyError, RoomError};
use crate::protocol::{ActionRequest, ClientEnvelope, ClientMessage, ServerMessage};
use crate::store::{RoomSnapshot, SnapshotStore, StoreError};

/// Characters used in room codes. Omits 0/O and 1/I.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Attempts at finding an unused code before giving up.
const CODE_ATTEMPTS: usize = 64;

/// Delivers server messages to clients. Implemented by the transport.
///
/// Called without any room lock held.
pub trait Broadcaster: Send + Sync {
    fn send(&self, room_code: &str, to: PlayerId, message: &ServerMessage);
}

/// Broadcaster that keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    sent: Mutex<Vec<(String, PlayerId, ServerMessage)>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything sent so far.
    pub fn drain(&self) -> Vec<(String, PlayerId, ServerMessage)> {
        self.sent
            .lock()
            .map(|mut sent| std::mem::take(&mut *sent))
            .unwrap_or_default()
    }

    /// Remove and return what one player received.
    pub fn drain_for(&self, player: PlayerId) -> Vec<ServerMessage> {
        let Ok(mut sent) = self.sent.lock() else {
            return Vec::new();
        };
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *sent)
            .into_iter()
            .partition(|(_, to, _)| *to == player);
        *sent = rest;
        mine.into_iter().map(|(_, _, m)| m).collect()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn send(&self, room_code: &str, to: PlayerId, message: &ServerMessage) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((room_code.to_string(), to, message.clone()));
        }
    }
}

/// A client's place in a room, known to the transport after it created,
/// joined or reconnected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Session {
    pub room_code: String,
    pub player_id: PlayerId,
}

/// Result of dispatching one client message.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// The client's session after the message (new after create/join).
    pub session: Option<Session>,
    /// Direct reply for the sender, used for rejections.
    pub reply: Option<ServerMessage>,
}

/// Result of a periodic cleanup pass.
#[derive(Debug, Default, PartialEq)]
pub struct CleanupResult {
    pub timeouts_resolved: usize,
    pub bot_actions: usize,
    pub expired_players: Vec<(String, PlayerId)>,
    pub closed_rooms: Vec<String>,
}

impl CleanupResult {
    pub fn is_empty(&self) -> bool {
        self.timeouts_resolved == 0
            && self.bot_actions == 0
            && self.expired_players.is_empty()
            && self.closed_rooms.is_empty()
    }
}

struct RoomSlot {
    state: Mutex<Room>,
    delivery: Mutex<()>,
}

impl RoomSlot {
    fn new(room: Room) -> Self {
        Self {
            state: Mutex::new(room),
            delivery: Mutex::new(()),
        }
    }
}

/// Maps room codes to live rooms.
pub struct RoomManager {
    config: ServerConfig,
    rooms: RwLock<HashMap<String, Arc<RoomSlot>>>,
    next_player_id: AtomicU64,
    rng: Mutex<GameRng>,
    broadcaster: Arc<dyn Broadcaster>,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl RoomManager {
    pub fn new(config: ServerConfig, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self::with_rng(config, broadcaster, GameRng::from_entropy())
    }

    /// Manager whose room codes and shuffles derive from `seed`.
    pub fn with_seed(config: ServerConfig, broadcaster: Arc<dyn Broadcaster>, seed: u64) -> Self {
        Self::with_rng(config, broadcaster, GameRng::new(seed))
    }

    fn with_rng(config: ServerConfig, broadcaster: Arc<dyn Broadcaster>, rng: GameRng) -> Self {
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            next_player_id: AtomicU64::new(1),
            rng: Mutex::new(rng),
            broadcaster,
            store: None,
        }
    }

    /// Persist a snapshot after every committed mutation.
    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn normalize(code: &str) -> String {
        code.trim().to_uppercase()
    }

    fn slot(&self, code: &str) -> Result<Arc<RoomSlot>, ActionError> {
        let code = Self::normalize(code);
        let rooms = self
            .rooms
            .read()
            .map_err(|_| InternalConsistencyError::LockPoisoned("room table"))?;
        rooms
            .get(&code)
            .cloned()
            .ok_or_else(|| RoomError::NotFound(code).into())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn room_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self
            .rooms
            .read()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        codes.sort();
        codes
    }

    pub fn contains(&self, code: &str) -> bool {
        self.slot(code).is_ok()
    }

    pub fn summary(&self, code: &str) -> Result<RoomSummary, ActionError> {
        self.read(code, |room| Ok(room.summary()))
    }

    /// Full state of a room as `viewer` sees it.
    pub fn view(&self, code: &str, viewer: PlayerId) -> Result<GameView, ActionError> {
        self.read(code, |room| {
            room.require_member(viewer)?;
            Ok(room.game().view_for(viewer))
        })
    }

    /// Run `f` against the room's game while holding its lock.
    pub fn inspect<T>(&self, code: &str, f: impl FnOnce(&GameState) -> T) -> Result<T, ActionError> {
        self.read(code, |room| Ok(f(room.game())))
    }

    fn read<T>(&self, code: &str, f: impl FnOnce(&Room) -> Result<T, ActionError>) -> Result<T, ActionError> {
        let slot = self.slot(code)?;
        let room = slot
            .state
            .lock()
            .map_err(|_| InternalConsistencyError::LockPoisoned("room"))?;
        f(&room)
    }

    /// Lock the room, apply `f`, release, then deliver and persist.
    ///
    /// A fatal error terminates the room; other errors leave it untouched.
    fn mutate<T>(
        &self,
        code: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut Room) -> Result<T, ActionError>,
    ) -> Result<T, ActionError> {
        let slot = self.slot(code)?;
        let (result, snapshot, close) = {
            let mut room = slot
                .state
                .lock()
                .map_err(|_| InternalConsistencyError::LockPoisoned("room"))?;
            let seq_before = room.game().seq();
            let result = f(&mut room);
            if let Err(err) = &result {
                if err.is_fatal() {
                    room.terminate(err);
                }
            }
            // A rejected request may still have resolved timeouts first.
            let changed = result.is_ok() || room.game().seq() != seq_before;
            let snapshot = (changed && self.config.persist_snapshots && self.store.is_some())
                .then(|| RoomSnapshot::capture(room.game(), now));
            (result, snapshot, room.should_close())
        };

        self.flush(&slot);
        if let Some(snapshot) = snapshot {
            self.persist(snapshot);
        }
        if close {
            self.close_room(code);
        }
        result
    }

    /// Deliver everything queued in the room's outbox, in order.
    fn flush(&self, slot: &RoomSlot) {
        let Ok(_turn) = slot.delivery.lock() else {
            tracing::error!("delivery lock poisoned");
            return;
        };
        let (code, outbox) = match slot.state.lock() {
            Ok(mut room) => (room.code.clone(), room.take_outbox()),
            Err(_) => return,
        };
        for outbound in outbox {
            self.broadcaster.send(&code, outbound.to, &outbound.message);
        }
    }

    fn persist(&self, snapshot: RoomSnapshot) {
        let Some(store) = &self.store else {
            return;
        };
        let code = snapshot.room_code.clone();
        if let Err(err) = store.save(snapshot) {
            tracing::error!(room = %code, error = %err, "failed to persist snapshot");
        }
    }

    fn close_room(&self, code: &str) {
        let code = Self::normalize(code);
        let removed = match self.rooms.write() {
            Ok(mut rooms) => rooms.remove(&code).is_some(),
            Err(_) => false,
        };
        if !removed {
            return;
        }
        if let Some(store) = &self.store {
            if let Err(err) = store.delete(&code) {
                tracing::error!(room = %code, error = %err, "failed to delete snapshot");
            }
        }
        tracing::info!(room = %code, "room closed");
    }

    fn next_player_id(&self) -> PlayerId {
        PlayerId(self.next_player_id.fetch_add(1, Ordering::Relaxed))
    }

    fn fork_rng(&self) -> Result<GameRng, ActionError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| InternalConsistencyError::LockPoisoned("manager rng"))?;
        Ok(rng.fork())
    }

    fn generate_code(&self, taken: &HashMap<String, Arc<RoomSlot>>) -> Result<String, ActionError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| InternalConsistencyError::LockPoisoned("manager rng"))?;
        for _ in 0..CODE_ATTEMPTS {
            let code: String = (0..self.config.room_code_length)
                .map(|_| CODE_ALPHABET[rng.gen_index(CODE_ALPHABET.len())] as char)
                .collect();
            if !taken.contains_key(&code) {
                return Ok(code);
            }
        }
        Err(RoomError::CodeSpaceExhausted.into())
    }

    /// Open a new room with `host_name` as its host. Returns the room code
    /// and the host's player id.
    pub fn create_room(
        &self,
        host_name: &str,
        settings: Option<GameSettings>,
        now: DateTime<Utc>,
    ) -> Result<(String, PlayerId), ActionError> {
        let settings = settings.unwrap_or_else(|| self.config.default_settings.clone());
        let host_id = self.next_player_id();
        let game_rng = self.fork_rng()?;

        let slot = {
            let mut rooms = self
                .rooms
                .write()
                .map_err(|_| InternalConsistencyError::LockPoisoned("room table"))?;
            let code = self.generate_code(&rooms)?;
            let game = GameState::new(code.clone(), settings, game_rng);
            let room = Room::new(game, Player::new(host_id, host_name), self.config.max_players_per_room, now)?;
            let slot = Arc::new(RoomSlot::new(room));
            rooms.insert(code, Arc::clone(&slot));
            slot
        };

        let (code, snapshot) = match slot.state.lock() {
            Ok(room) => (
                room.code.clone(),
                self.config
                    .persist_snapshots
                    .then(|| RoomSnapshot::capture(room.game(), now)),
            ),
            Err(_) => return Err(InternalConsistencyError::LockPoisoned("room").into()),
        };
        self.flush(&slot);
        if let Some(snapshot) = snapshot {
            self.persist(snapshot);
        }
        tracing::info!(room = %code, host = %host_id, "room created");
        Ok((code, host_id))
    }

    pub fn join_room(&self, code: &str, player_name: &str, now: DateTime<Utc>) -> Result<PlayerId, ActionError> {
        let id = self.next_player_id();
        let allow_late_join = self.config.allow_late_join;
        self.mutate(code, now, |room| {
            room.join(Player::new(id, player_name), allow_late_join, now)
        })?;
        Ok(id)
    }

    pub fn leave_room(&self, code: &str, player: PlayerId, now: DateTime<Utc>) -> Result<(), ActionError> {
        self.mutate(code, now, |room| room.leave(player, now))?;
        self.drive_bots(code, now).map(|_| ())
    }

    /// Seat a bot. Only the host may do this, and only between rounds.
    pub fn add_bot(
        &self,
        code: &str,
        requester: PlayerId,
        name: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<PlayerId, ActionError> {
        let id = self.next_player_id();
        let name = name.unwrap_or_else(|| format!("Bot {}", id.0));
        self.mutate(code, now, |room| room.add_bot(requester, Player::bot(id, name), now))?;
        Ok(id)
    }

    pub fn start_game(
        &self,
        code: &str,
        requester: PlayerId,
        settings: Option<GameSettings>,
        now: DateTime<Utc>,
    ) -> Result<(), ActionError> {
        let min_players = self.config.min_players_to_start;
        self.mutate(code, now, |room| room.start_game(requester, settings, min_players, now))?;
        self.drive_bots(code, now).map(|_| ())
    }

    pub fn end_session(&self, code: &str, requester: PlayerId, now: DateTime<Utc>) -> Result<(), ActionError> {
        self.mutate(code, now, |room| room.end_session(requester, now))
    }

    pub fn disconnect(&self, code: &str, player: PlayerId, now: DateTime<Utc>) -> Result<(), ActionError> {
        let grace = self.config.reconnect_grace();
        self.mutate(code, now, |room| room.disconnect(player, now, grace))
    }

    /// Reattach a client to its seat. Idempotent for connected clients.
    pub fn reconnect(&self, code: &str, player: PlayerId, now: DateTime<Utc>) -> Result<(), ActionError> {
        self.mutate(code, now, |room| room.reconnect(player, now))
    }

    pub fn acknowledge(&self, code: &str, player: PlayerId, seq: u64, now: DateTime<Utc>) -> Result<(), ActionError> {
        self.mutate(code, now, |room| room.acknowledge(player, seq, now))
    }

    pub fn resync(&self, code: &str, player: PlayerId, now: DateTime<Utc>) -> Result<(), ActionError> {
        self.mutate(code, now, |room| room.resync(player))
    }

    /// Apply a gameplay request. Returns the committed sequence number.
    pub fn submit(
        &self,
        code: &str,
        player: PlayerId,
        request: ActionRequest,
        now: DateTime<Utc>,
    ) -> Result<u64, ActionError> {
        let seq = self.mutate(code, now, |room| room.submit(player, request, now))?;
        self.drive_bots(code, now)?;
        Ok(seq)
    }

    /// Let bots take every decision they own. Returns actions applied.
    pub fn drive_bots(&self, code: &str, now: DateTime<Utc>) -> Result<usize, ActionError> {
        match self.mutate(code, now, |room| room.drive_bots(now)) {
            Err(ActionError::Room(RoomError::NotFound(_))) => Ok(0),
            other => other,
        }
    }

    /// Resolve expired deadlines in one room.
    pub fn force_advance(&self, code: &str, now: DateTime<Utc>) -> Result<usize, ActionError> {
        self.mutate(code, now, |room| room.force_advance(now))
    }

    /// Periodic housekeeping: resolve timeouts, expire lapsed sessions,
    /// let bots act and drop rooms nobody is in anymore.
    pub fn tick(&self, now: DateTime<Utc>) -> CleanupResult {
        let mut result = CleanupResult::default();

        for code in self.room_codes() {
            let outcome = self.mutate(&code, now, |room| {
                let resolved = room.force_advance(now)?;
                let expired = room.expire_stale(now)?;
                Ok((resolved, expired))
            });
            match outcome {
                Ok((resolved, expired)) => {
                    result.timeouts_resolved += resolved;
                    result
                        .expired_players
                        .extend(expired.into_iter().map(|p| (code.clone(), p)));
                }
                Err(err) => {
                    tracing::warn!(room = %code, error = %err, "tick failed");
                }
            }

            match self.drive_bots(&code, now) {
                Ok(applied) => result.bot_actions += applied,
                Err(err) => tracing::warn!(room = %code, error = %err, "bots failed"),
            }

            if !self.contains(&code) {
                result.closed_rooms.push(code);
            }
        }
        result
    }

    /// Revive every stored room that is not already live. Restored players
    /// start disconnected and must reconnect within the grace period.
    pub fn restore_from(&self, store: &dyn SnapshotStore, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let grace = self.config.reconnect_grace();
        let mut rooms = self.rooms.write().map_err(|_| StoreError::LockPoisoned)?;
        let mut restored = 0;

        for snapshot in store.load_all()? {
            let code = Self::normalize(&snapshot.room_code);
            if rooms.contains_key(&code) || snapshot.game.status.is_terminal() {
                continue;
            }
            if let Some(max_id) = snapshot.game.players().iter().map(|p| p.id.0).max() {
                self.next_player_id.fetch_max(max_id + 1, Ordering::Relaxed);
            }
            let room = match Room::restore(snapshot.game, self.config.max_players_per_room, now, grace) {
                Ok(room) => room,
                Err(err) => {
                    tracing::error!(room = %code, seq = snapshot.seq, error = %err, "skipping corrupt snapshot");
                    continue;
                }
            };
            rooms.insert(code.clone(), Arc::new(RoomSlot::new(room)));
            tracing::info!(room = %code, seq = snapshot.seq, "room restored");
            restored += 1;
        }
        Ok(restored)
    }

    /// Route one client message. `origin` is the sender's session, if it
    /// has one. Rejections come back in [`Dispatch::reply`]; everything
    /// else goes through the broadcaster.
    pub fn dispatch(&self, origin: Option<&Session>, envelope: ClientEnvelope, now: DateTime<Utc>) -> Dispatch {
        let action_id = envelope.action_id.clone();
        match self.route(origin, envelope, now) {
            Ok(session) => Dispatch { session, reply: None },
            Err(err) => Dispatch {
                session: origin.cloned(),
                reply: Some(ServerMessage::rejected(&err, action_id)),
            },
        }
    }

    fn route(
        &self,
        origin: Option<&Session>,
        envelope: ClientEnvelope,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, ActionError> {
        let ClientEnvelope {
            action_id,
            based_on_seq,
            message,
        } = envelope;
        let session = |room_code: String, player_id: PlayerId| Some(Session { room_code, player_id });

        let message = match message {
            ClientMessage::CreateRoom { player_name, settings } => {
                let (code, id) = self.create_room(&player_name, settings, now)?;
                return Ok(session(code, id));
            }
            ClientMessage::JoinRoom { room_code, player_name } => {
                let id = self.join_room(&room_code, &player_name, now)?;
                return Ok(session(Self::normalize(&room_code), id));
            }
            ClientMessage::Reconnect { room_code, player_id } => {
                self.reconnect(&room_code, player_id, now)?;
                return Ok(session(Self::normalize(&room_code), player_id));
            }
            other => other,
        };

        let Some(origin) = origin else {
            return Err(RoomError::NotMember.into());
        };
        let (code, player) = (origin.room_code.as_str(), origin.player_id);

        match message {
            ClientMessage::LeaveRoom => {
                self.leave_room(code, player, now)?;
                return Ok(None);
            }
            ClientMessage::EndSession => {
                self.end_session(code, player, now)?;
                return Ok(None);
            }
            ClientMessage::AddBot { name } => {
                self.add_bot(code, player, name, now)?;
            }
            ClientMessage::StartGame { settings } => self.start_game(code, player, settings, now)?,
            ClientMessage::Ack { seq } => self.acknowledge(code, player, seq, now)?,
            ClientMessage::RequestResync => self.resync(code, player, now)?,
            other => {
                if let Some(action) = other.action() {
                    let request = ActionRequest {
                        action_id,
                        based_on_seq,
                        action,
                    };
                    self.submit(code, player, request, now)?;
                }
            }
        }
        Ok(Some(origin.clone()))
    }
}
