//! Client/server message contract.
//!
//! Every message is JSON with a `type` tag. Gameplay requests travel in a
//! [`ClientEnvelope`] that may carry an `actionId` (echoed back on
//! rejection) and the `basedOnSeq` the client acted on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ActionError;
use crate::state::card::{Card, CardId, Color};
use crate::state::game::{Action, Change, Delta, GameView};
use crate::state::player::{PlayerId, PublicPlayer};
use crate::state::settings::GameSettings;

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    CreateRoom {
        player_name: String,
        #[serde(default)]
        settings: Option<GameSettings>,
    },
    JoinRoom {
        room_code: String,
        player_name: String,
    },
    LeaveRoom,
    AddBot {
        #[serde(default)]
        name: Option<String>,
    },
    StartGame {
        #[serde(default)]
        settings: Option<GameSettings>,
    },
    PlayCard {
        card_id: CardId,
        #[serde(default)]
        declared_color: Option<Color>,
        #[serde(default)]
        target_player_id: Option<PlayerId>,
    },
    DrawCard,
    PassTurn,
    CallUno,
    CallOut {
        target_player_id: PlayerId,
    },
    ChooseColor {
        color: Color,
    },
    Reconnect {
        room_code: String,
        player_id: PlayerId,
    },
    Ack {
        seq: u64,
    },
    RequestResync,
    EndSession,
}

impl ClientMessage {
    /// The gameplay action this message requests, if any.
    pub fn action(&self) -> Option<Action> {
        let action = match self {
            Self::PlayCard {
                card_id,
                declared_color,
                target_player_id,
            } => Action::PlayCard {
                card_id: *card_id,
                declared_color: *declared_color,
                target_player_id: *target_player_id,
            },
            Self::DrawCard => Action::DrawCard,
            Self::PassTurn => Action::PassTurn,
            Self::CallUno => Action::CallUno,
            Self::CallOut { target_player_id } => Action::CallOut {
                target_player_id: *target_player_id,
            },
            Self::ChooseColor { color } => Action::ChooseColor { color: *color },
            _ => return None,
        };
        Some(action)
    }
}

/// A client message plus request metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub based_on_seq: Option<u64>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

impl ClientEnvelope {
    pub fn new(message: ClientMessage) -> Self {
        Self {
            action_id: None,
            based_on_seq: None,
            message,
        }
    }

    pub fn with_action_id(mut self, id: impl Into<String>) -> Self {
        self.action_id = Some(id.into());
        self
    }

    pub fn based_on(mut self, seq: u64) -> Self {
        self.based_on_seq = Some(seq);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Split into a gameplay request, if this is one.
    pub fn into_request(self) -> Option<ActionRequest> {
        let action = self.message.action()?;
        Some(ActionRequest {
            action_id: self.action_id,
            based_on_seq: self.based_on_seq,
            action,
        })
    }
}

/// A gameplay action with its request metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub action_id: Option<String>,
    pub based_on_seq: Option<u64>,
    pub action: Action,
}

impl ActionRequest {
    pub fn new(action: Action) -> Self {
        Self {
            action_id: None,
            based_on_seq: None,
            action,
        }
    }
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    RoomCreated {
        room_code: String,
        player_id: PlayerId,
    },
    RoomJoined {
        room_code: String,
        player_id: PlayerId,
    },
    StateSnapshot {
        full_state: GameView,
        seq: u64,
    },
    StateDelta {
        changes: Vec<Change>,
        /// The receiver's new hand, when it changed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hand: Option<Vec<Card>>,
        seq: u64,
    },
    ActionRejected {
        reason: String,
        message: String,
        #[serde(default)]
        related_action_id: Option<String>,
    },
    PlayerJoined {
        player: PublicPlayer,
        seq: u64,
    },
    PlayerLeft {
        player_id: PlayerId,
        seq: u64,
    },
    PlayerDisconnected {
        player_id: PlayerId,
        seq: u64,
    },
    PlayerReconnected {
        player_id: PlayerId,
        seq: u64,
    },
    RoundEnded {
        winner_id: Option<PlayerId>,
        scores: BTreeMap<PlayerId, u32>,
        seq: u64,
    },
    RoomTerminated {
        reason: String,
    },
}

impl ServerMessage {
    pub fn rejected(err: &ActionError, related_action_id: Option<String>) -> Self {
        Self::ActionRejected {
            reason: err.reason_code().to_string(),
            message: err.to_string(),
            related_action_id,
        }
    }

    pub fn snapshot(view: GameView) -> Self {
        let seq = view.seq;
        Self::StateSnapshot {
            full_state: view,
            seq,
        }
    }

    /// Sequence number of a state-bearing message. Only these feed a
    /// [`SyncTracker`].
    pub fn state_seq(&self) -> Option<u64> {
        match self {
            Self::StateSnapshot { seq, .. } | Self::StateDelta { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Sequence number the message belongs to, if any.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::StateSnapshot { seq, .. }
            | Self::StateDelta { seq, .. }
            | Self::PlayerJoined { seq, .. }
            | Self::PlayerLeft { seq, .. }
            | Self::PlayerDisconnected { seq, .. }
            | Self::PlayerReconnected { seq, .. }
            | Self::RoundEnded { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Messages one viewer receives for a committed delta: the delta itself
/// followed by lifecycle notices derived from it.
pub fn messages_for(delta: &Delta, viewer: PlayerId) -> Vec<ServerMessage> {
    let seq = delta.seq;
    let mut messages = vec![ServerMessage::StateDelta {
        changes: delta.changes.clone(),
        hand: delta.hand_for(viewer).cloned(),
        seq,
    }];

    for change in &delta.changes {
        let notice = match change {
            Change::PlayerJoined { player } => ServerMessage::PlayerJoined {
                player: player.clone(),
                seq,
            },
            Change::PlayerLeft { player_id } => ServerMessage::PlayerLeft {
                player_id: *player_id,
                seq,
            },
            Change::ConnectionChanged {
                player_id,
                connected: true,
            } => ServerMessage::PlayerReconnected {
                player_id: *player_id,
                seq,
            },
            Change::ConnectionChanged {
                player_id,
                connected: false,
            } => ServerMessage::PlayerDisconnected {
                player_id: *player_id,
                seq,
            },
            Change::RoundEnded { winner, scores, .. } => ServerMessage::RoundEnded {
                winner_id: *winner,
                scores: scores.clone(),
                seq,
            },
            _ => continue,
        };
        messages.push(notice);
    }
    messages
}

/// How a client should treat an incoming sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    Apply,
    /// Already applied; drop it.
    Duplicate,
    /// One or more deltas were missed; request a resync.
    Gap { expected: u64, received: u64 },
}

/// Client-side ordering check for state messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncTracker {
    last_seq: Option<u64>,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Classify a state message and advance on `Apply`. Snapshots always
    /// apply and reset the baseline.
    pub fn observe(&mut self, message: &ServerMessage) -> Option<SyncDecision> {
        let seq = message.state_seq()?;
        if let ServerMessage::StateSnapshot { .. } = message {
            self.last_seq = Some(seq);
            return Some(SyncDecision::Apply);
        }
        Some(self.observe_seq(seq))
    }

    pub fn observe_seq(&mut self, seq: u64) -> SyncDecision {
        match self.last_seq {
            Some(last) if seq <= last => SyncDecision::Duplicate,
            Some(last) if seq > last + 1 => SyncDecision::Gap {
                expected: last + 1,
                received: seq,
            },
            None => SyncDecision::Gap {
                expected: 0,
                received: seq,
            },
            _ => {
                self.last_seq = Some(seq);
                SyncDecision::Apply
            }
        }
    }
}
