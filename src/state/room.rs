//! Room state.
//!
//! A room owns one [`GameState`] plus the registry of clients attached to
//! it. Every committed delta is fanned out per viewer into the room's
//! outbox and each client's replay buffer while the room is locked; the
//! manager delivers the outbox after releasing the lock.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::bot;
use super::connection::{Connection, ConnectionRegistry, Replay};
use super::game::{Delta, GameState};
use super::player::{Player, PlayerId};
use super::settings::GameSettings;
use super::status::GameStatus;
use crate::error::{ActionError, InternalConsistencyError, RoomError, ValidationError};
use crate::protocol::{messages_for, ActionRequest, ServerMessage};

/// Upper bound on bot actions applied in one call, so a misbehaving
/// policy cannot spin forever while holding the room.
const MAX_BOT_ACTIONS: usize = 2_000;

/// Upper bound on timeouts resolved in one call.
const MAX_TIMEOUTS: usize = 64;

/// A message waiting to be delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: PlayerId,
    pub message: ServerMessage,
}

/// Room listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_code: String,
    pub status: GameStatus,
    pub players: usize,
    pub connected: usize,
    pub max_players: usize,
    pub host_id: Option<PlayerId>,
    pub round: u32,
    pub seq: u64,
}

#[derive(Debug)]
pub struct Room {
    pub code: String,
    game: GameState,
    connections: ConnectionRegistry,
    pub max_players: usize,
    pub created_at: DateTime<Utc>,
    outbox: Vec<Outbound>,
    closed: bool,
}

impl Room {
    /// Open a room with its host seated.
    pub fn new(game: GameState, host: Player, max_players: usize, now: DateTime<Utc>) -> Result<Self, ActionError> {
        let code = game.room_code.clone();
        let mut room = Self {
            code,
            game,
            connections: ConnectionRegistry::new(),
            max_players,
            created_at: now,
            outbox: Vec::new(),
            closed: false,
        };

        let host_id = host.id;
        room.game.add_player(host.with_host(true), false)?;
        room.connections.add(Connection::new(host_id, now));
        room.send(
            host_id,
            ServerMessage::RoomCreated {
                room_code: room.code.clone(),
                player_id: host_id,
            },
        );
        room.send_snapshot(host_id);
        Ok(room)
    }

    /// Rebuild a room from persisted state. Every human starts out
    /// disconnected and must reconnect within `grace`. The game comes back
    /// at its persisted sequence number.
    pub fn restore(
        mut game: GameState,
        max_players: usize,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Self, InternalConsistencyError> {
        game.check_invariants()?;
        let humans: Vec<PlayerId> = game
            .players()
            .iter()
            .filter(|p| !p.is_bot)
            .map(|p| p.id)
            .collect();

        let mut connections = ConnectionRegistry::new();
        for id in humans {
            game.mark_disconnected(id);
            connections.add(Connection::restored(id, now, grace));
        }

        Ok(Self {
            code: game.room_code.clone(),
            game,
            connections,
            max_players,
            created_at: now,
            outbox: Vec::new(),
            closed: false,
        })
    }

    pub fn game(&self) -> &GameState {
        &self.game
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn has_member(&self, player_id: PlayerId) -> bool {
        self.game.has_player(player_id)
    }

    pub fn is_host(&self, player_id: PlayerId) -> bool {
        self.game.host_id() == Some(player_id)
    }

    pub fn require_member(&self, player_id: PlayerId) -> Result<(), RoomError> {
        if self.has_member(player_id) {
            Ok(())
        } else {
            Err(RoomError::NotMember)
        }
    }

    pub fn require_host(&self, player_id: PlayerId) -> Result<(), RoomError> {
        self.require_member(player_id)?;
        if self.is_host(player_id) {
            Ok(())
        } else {
            Err(RoomError::NotHost)
        }
    }

    pub fn member_count(&self) -> usize {
        self.game.player_count()
    }

    pub fn is_full(&self) -> bool {
        self.member_count() >= self.max_players
    }

    /// No human is seated anymore.
    pub fn is_abandoned(&self) -> bool {
        self.game.players().iter().all(|p| p.is_bot)
    }

    /// Whether the manager should drop this room.
    pub fn should_close(&self) -> bool {
        self.closed || self.is_abandoned() || self.game.status == GameStatus::Terminated
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_code: self.code.clone(),
            status: self.game.status,
            players: self.member_count(),
            connected: self.connections.connected_count(),
            max_players: self.max_players,
            host_id: self.game.host_id(),
            round: self.game.round(),
            seq: self.game.seq(),
        }
    }

    pub fn join(&mut self, player: Player, allow_late_join: bool, now: DateTime<Utc>) -> Result<(), ActionError> {
        if self.game.status.is_terminal() {
            return Err(RoomError::Terminated.into());
        }
        if self.is_full() {
            return Err(RoomError::Full.into());
        }

        let id = player.id;
        let is_bot = player.is_bot;
        let delta = self.game.add_player(player, allow_late_join)?;
        self.publish(&delta, now);

        if !is_bot {
            self.connections.add(Connection::new(id, now));
            self.send(
                id,
                ServerMessage::RoomJoined {
                    room_code: self.code.clone(),
                    player_id: id,
                },
            );
            self.send_snapshot(id);
        }
        tracing::info!(room = %self.code, player = %id, bot = is_bot, "player joined");
        Ok(())
    }

    /// Seat a bot on the host's behalf. Bots only join between rounds.
    pub fn add_bot(&mut self, requester: PlayerId, bot: Player, now: DateTime<Utc>) -> Result<(), ActionError> {
        self.require_host(requester)?;
        if self.game.status.is_active() {
            return Err(RoomError::GameAlreadyStarted.into());
        }
        self.join(bot, false, now)
    }

    pub fn leave(&mut self, player_id: PlayerId, now: DateTime<Utc>) -> Result<(), ActionError> {
        let delta = self.game.remove_player(player_id, now)?;
        self.connections.remove(player_id);
        self.publish(&delta, now);
        tracing::info!(room = %self.code, player = %player_id, "player left");
        Ok(())
    }

    /// Keep the seat but stop delivering to the client.
    pub fn disconnect(&mut self, player_id: PlayerId, now: DateTime<Utc>, grace: Duration) -> Result<(), ActionError> {
        self.require_member(player_id)?;
        if !self.connections.disconnect(player_id, now, grace) {
            return Ok(());
        }
        if let Some(delta) = self.game.set_connected(player_id, false)? {
            self.publish(&delta, now);
        }
        tracing::debug!(room = %self.code, player = %player_id, "player disconnected");
        Ok(())
    }

    /// Restore a disconnected seat. Replays what the client missed, or a
    /// fresh snapshot when the buffer cannot cover the gap. Reconnecting an
    /// already connected client sends nothing.
    pub fn reconnect(&mut self, player_id: PlayerId, now: DateTime<Utc>) -> Result<(), ActionError> {
        self.require_member(player_id)?;
        if self.game.player(player_id).map_or(false, |p| p.is_bot) {
            return Err(RoomError::NotMember.into());
        }

        let replay = match self.connections.get_mut(player_id) {
            Some(conn) => conn.reconnect(now)?,
            None => {
                self.connections.add(Connection::new(player_id, now));
                Replay::Snapshot
            }
        };

        // Missed messages go out before the reconnect notice itself.
        match replay {
            Replay::Messages(messages) => {
                for pending in messages {
                    self.send(player_id, pending.message);
                }
            }
            Replay::Snapshot => self.send_snapshot(player_id),
        }

        if let Some(delta) = self.game.set_connected(player_id, true)? {
            self.publish(&delta, now);
        }
        tracing::info!(room = %self.code, player = %player_id, "player reconnected");
        Ok(())
    }

    /// Remove players whose reconnect grace period lapsed.
    pub fn expire_stale(&mut self, now: DateTime<Utc>) -> Result<Vec<PlayerId>, ActionError> {
        let expired = self.connections.expire_stale(now);
        for id in &expired {
            if self.game.has_player(*id) {
                let delta = self.game.remove_player(*id, now)?;
                self.publish(&delta, now);
            }
            tracing::info!(room = %self.code, player = %id, "reconnect grace expired");
        }
        Ok(expired)
    }

    pub fn acknowledge(&mut self, player_id: PlayerId, seq: u64, now: DateTime<Utc>) -> Result<(), ActionError> {
        let conn = self
            .connections
            .get_mut(player_id)
            .ok_or(RoomError::NotMember)?;
        conn.touch(now);
        conn.acknowledge(seq);
        Ok(())
    }

    pub fn resync(&mut self, player_id: PlayerId) -> Result<(), ActionError> {
        self.require_member(player_id)?;
        self.send_snapshot(player_id);
        Ok(())
    }

    pub fn start_game(
        &mut self,
        requester: PlayerId,
        settings: Option<GameSettings>,
        min_players: usize,
        now: DateTime<Utc>,
    ) -> Result<(), ActionError> {
        self.require_host(requester)?;
        if self.member_count() < min_players {
            return Err(ValidationError::NotEnoughPlayers.into());
        }
        let settings = settings.unwrap_or_else(|| self.game.settings.clone());
        let delta = self.game.start_round(settings, now)?;
        self.publish(&delta, now);
        Ok(())
    }

    /// Apply one gameplay request. Returns the sequence number it
    /// committed at.
    pub fn submit(&mut self, player_id: PlayerId, request: ActionRequest, now: DateTime<Utc>) -> Result<u64, ActionError> {
        if let Some(conn) = self.connections.get_mut(player_id) {
            conn.touch(now);
        }
        // Deadlines that lapsed before the request arrived resolve first.
        let resolved = self.force_advance(now)?;
        if resolved > 0 {
            tracing::debug!(room = %self.code, resolved, "timeouts resolved ahead of action");
        }
        let result = self
            .game
            .submit_action_at(player_id, request.action, request.based_on_seq, now);
        match result {
            Ok(delta) => {
                tracing::debug!(room = %self.code, player = %player_id, seq = delta.seq, "action applied");
                let seq = delta.seq;
                self.publish(&delta, now);
                Ok(seq)
            }
            Err(err) => {
                if err.requires_resync() {
                    tracing::warn!(
                        room = %self.code,
                        player = %player_id,
                        seq = self.game.seq(),
                        based_on = ?request.based_on_seq,
                        "stale action"
                    );
                }
                Err(err)
            }
        }
    }

    /// Resolve every expired deadline. Returns how many were resolved.
    pub fn force_advance(&mut self, now: DateTime<Utc>) -> Result<usize, ActionError> {
        let mut resolved = 0;
        while resolved < MAX_TIMEOUTS {
            let Some(delta) = self.game.force_advance(now)? else {
                break;
            };
            self.publish(&delta, now);
            resolved += 1;
        }
        Ok(resolved)
    }

    /// Let bots act while a bot owns the next decision.
    pub fn drive_bots(&mut self, now: DateTime<Utc>) -> Result<usize, ActionError> {
        let mut applied = 0;
        while applied < MAX_BOT_ACTIONS {
            let Some(owner) = self.game.decision_owner() else {
                break;
            };
            if !self.game.player(owner).map_or(false, |p| p.is_bot) {
                break;
            }
            let actions = bot::plan(&self.game, owner);
            if actions.is_empty() {
                break;
            }
            for action in actions {
                match self.game.submit_action(owner, action, now) {
                    Ok(delta) => {
                        self.publish(&delta, now);
                        applied += 1;
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        tracing::warn!(room = %self.code, bot = %owner, error = %err, "bot action rejected");
                        return Ok(applied);
                    }
                }
            }
        }
        Ok(applied)
    }

    /// Host ends the whole session. The room closes afterwards.
    pub fn end_session(&mut self, requester: PlayerId, now: DateTime<Utc>) -> Result<(), ActionError> {
        self.require_host(requester)?;
        let delta = self.game.end_session()?;
        self.publish(&delta, now);
        self.closed = true;
        tracing::info!(room = %self.code, "session ended by host");
        Ok(())
    }

    /// Tear the room down after an internal failure and tell every client.
    pub fn terminate(&mut self, reason: &ActionError) {
        tracing::error!(room = %self.code, error = %reason, "terminating room");
        self.game.terminate();
        self.closed = true;
        for id in self.connections.connected_players() {
            self.send(
                id,
                ServerMessage::RoomTerminated {
                    reason: reason.reason_code().to_string(),
                },
            );
        }
    }

    /// Messages queued since the last call, in commit order.
    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Fan a delta out to every attached client. Disconnected clients only
    /// get it in their replay buffer.
    fn publish(&mut self, delta: &Delta, now: DateTime<Utc>) {
        for id in self.connections.all_players() {
            let messages = messages_for(delta, id);
            let Some(conn) = self.connections.get_mut(id) else {
                continue;
            };
            let connected = conn.status.is_connected();
            for message in messages {
                conn.record(delta.seq, message.clone(), now);
                if connected {
                    self.outbox.push(Outbound { to: id, message });
                }
            }
        }
    }

    fn send(&mut self, to: PlayerId, message: ServerMessage) {
        self.outbox.push(Outbound { to, message });
    }

    fn send_snapshot(&mut self, to: PlayerId) {
        let view = self.game.view_for(to);
        if let Some(conn) = self.connections.get_mut(to) {
            conn.reset_to(view.seq);
        }
        self.send(to, ServerMessage::snapshot(view));
    }
}
