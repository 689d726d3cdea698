//! Connection state management.
//!
//! Tracks each seated client's link to its room. Handles reconnection with
//! a grace period and keeps a replay buffer of messages the client has not
//! acknowledged yet.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};

use super::player::PlayerId;
use crate::error::RoomError;
use crate::protocol::ServerMessage;

/// Most unacknowledged messages kept per client. Older ones are dropped
/// and the client falls back to a full resync.
pub const MAX_REPLAY_BUFFER: usize = 256;

/// Connection state for a single player.
#[derive(Debug, Clone)]
pub struct Connection {
    pub player_id: PlayerId,

    /// Current connection status
    pub status: ConnectionStatus,

    /// When this connection was established
    pub connected_at: DateTime<Utc>,

    /// Last activity timestamp
    pub last_activity: DateTime<Utc>,

    /// Last sequence number acknowledged by the client
    pub ack_seq: u64,

    /// Messages pending acknowledgment (for replay on reconnect)
    pending_messages: VecDeque<PendingMessage>,

    /// Set when the buffer no longer covers everything the client missed
    needs_snapshot: bool,
}

/// Connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Actively connected
    Connected,

    /// Disconnected, within grace period for reconnection
    Disconnected {
        since: DateTime<Utc>,
        grace_until: DateTime<Utc>,
    },

    /// Grace period expired; the seat is gone
    Expired,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if within reconnection grace period.
    pub fn is_reconnectable(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Connected => true,
            Self::Disconnected { grace_until, .. } => now < *grace_until,
            Self::Expired => false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Expired => true,
            Self::Disconnected { grace_until, .. } => now >= *grace_until,
            Self::Connected => false,
        }
    }
}

/// A message pending acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub seq: u64,
    pub message: ServerMessage,
    pub sent_at: DateTime<Utc>,
}

/// What a client needs after reconnecting.
#[derive(Debug, Clone, PartialEq)]
pub enum Replay {
    /// Replay these buffered messages in order.
    Messages(Vec<PendingMessage>),
    /// The buffer cannot cover the gap; send a full snapshot instead.
    Snapshot,
}

impl Connection {
    pub fn new(player_id: PlayerId, now: DateTime<Utc>) -> Self {
        Self {
            player_id,
            status: ConnectionStatus::Connected,
            connected_at: now,
            last_activity: now,
            ack_seq: 0,
            pending_messages: VecDeque::new(),
            needs_snapshot: false,
        }
    }

    /// A seat revived from a snapshot: disconnected, with nothing to replay.
    pub fn restored(player_id: PlayerId, now: DateTime<Utc>, grace_period: Duration) -> Self {
        Self {
            status: ConnectionStatus::Disconnected {
                since: now,
                grace_until: now + grace_period,
            },
            needs_snapshot: true,
            ..Self::new(player_id, now)
        }
    }

    /// Mark as disconnected with a grace period. No-op unless connected.
    pub fn disconnect(&mut self, now: DateTime<Utc>, grace_period: Duration) -> bool {
        if !self.status.is_connected() {
            return false;
        }
        self.status = ConnectionStatus::Disconnected {
            since: now,
            grace_until: now + grace_period,
        };
        true
    }

    /// Restore `Connected` status and hand back what the client missed.
    ///
    /// Reconnecting an already connected client is a no-op that returns an
    /// empty replay.
    pub fn reconnect(&mut self, now: DateTime<Utc>) -> Result<Replay, RoomError> {
        match &self.status {
            ConnectionStatus::Connected => {
                self.last_activity = now;
                Ok(Replay::Messages(Vec::new()))
            }
            ConnectionStatus::Disconnected { grace_until, .. } if now < *grace_until => {
                self.status = ConnectionStatus::Connected;
                self.last_activity = now;
                if self.needs_snapshot {
                    Ok(Replay::Snapshot)
                } else {
                    Ok(Replay::Messages(self.pending_messages.iter().cloned().collect()))
                }
            }
            _ => {
                self.expire();
                Err(RoomError::SessionExpired)
            }
        }
    }

    pub fn expire(&mut self) {
        self.status = ConnectionStatus::Expired;
        self.pending_messages.clear();
    }

    /// Record activity (any message received).
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    /// Process acknowledgment from client.
    pub fn acknowledge(&mut self, ack: u64) {
        if ack <= self.ack_seq {
            return;
        }
        self.ack_seq = ack;
        while self.pending_messages.front().map_or(false, |m| m.seq <= ack) {
            self.pending_messages.pop_front();
        }
    }

    /// Record a message sent (or due) to this client.
    pub fn record(&mut self, seq: u64, message: ServerMessage, now: DateTime<Utc>) {
        if self.pending_messages.len() >= MAX_REPLAY_BUFFER {
            self.pending_messages.pop_front();
            self.needs_snapshot = true;
        }
        self.pending_messages.push_back(PendingMessage {
            seq,
            message,
            sent_at: now,
        });
    }

    /// Forget everything buffered; the client was just sent a snapshot at `seq`.
    pub fn reset_to(&mut self, seq: u64) {
        self.pending_messages.clear();
        self.needs_snapshot = false;
        self.ack_seq = self.ack_seq.max(seq);
    }

    pub fn pending_len(&self) -> usize {
        self.pending_messages.len()
    }

    /// Get messages newer than `seq`.
    pub fn messages_since(&self, seq: u64) -> Vec<&PendingMessage> {
        self.pending_messages.iter().filter(|m| m.seq > seq).collect()
    }
}

/// Connected-client registry of one room.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<PlayerId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, conn: Connection) {
        self.connections.insert(conn.player_id, conn);
    }

    pub fn get(&self, player_id: PlayerId) -> Option<&Connection> {
        self.connections.get(&player_id)
    }

    pub fn get_mut(&mut self, player_id: PlayerId) -> Option<&mut Connection> {
        self.connections.get_mut(&player_id)
    }

    pub fn remove(&mut self, player_id: PlayerId) -> Option<Connection> {
        self.connections.remove(&player_id)
    }

    /// Mark a connection as disconnected. Returns whether it changed.
    pub fn disconnect(&mut self, player_id: PlayerId, now: DateTime<Utc>, grace: Duration) -> bool {
        self.connections
            .get_mut(&player_id)
            .map(|conn| conn.disconnect(now, grace))
            .unwrap_or(false)
    }

    /// Expire connections whose grace period has lapsed.
    /// Returns list of expired player IDs.
    pub fn expire_stale(&mut self, now: DateTime<Utc>) -> Vec<PlayerId> {
        let mut expired: Vec<PlayerId> = self
            .connections
            .iter_mut()
            .filter(|(_, conn)| conn.status.is_expired(now))
            .map(|(id, conn)| {
                conn.expire();
                *id
            })
            .collect();
        expired.sort();

        for pid in &expired {
            self.connections.remove(pid);
        }
        expired
    }

    /// Every tracked player, including disconnected ones within grace.
    pub fn all_players(&self) -> Vec<PlayerId> {
        let mut ids: Vec<PlayerId> = self.connections.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn connected_players(&self) -> Vec<PlayerId> {
        let mut ids: Vec<PlayerId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.status.is_connected())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.status.is_connected())
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.connections.len()
    }

    /// Earliest grace deadline among disconnected clients.
    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.connections
            .values()
            .filter_map(|c| match c.status {
                ConnectionStatus::Disconnected { grace_until, .. } => Some(grace_until),
                _ => None,
            })
            .min()
    }
}
