//! Game lifecycle state machine.
//!
//! # State Diagram
//!
//! ```text
//! ┌───────────────────┐  start_round   ┌────────────┐
//! │ WaitingForPlayers │───────────────▶│ InProgress │◀──────┐
//! └─────────┬─────────┘                └─────┬──────┘       │
//!           │                                │ round_over   │ start_round
//!           │ end_session                    ▼              │
//!           │                          ┌────────────┐       │
//!           │                          │ RoundOver  │───────┘
//!           │                          └─────┬──────┘
//!           │          end_session /         │
//!           │          target score reached  │
//!           ▼                                ▼
//!      ┌─────────┐◀──────────────────────────┘
//!      │  Ended  │
//!      └─────────┘
//! ```
//!
//! `Terminated` is reachable from any state after an internal
//! consistency failure.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    #[default]
    WaitingForPlayers,
    InProgress,
    RoundOver,
    Ended,
    Terminated,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitingForPlayers => "waiting_for_players",
            Self::InProgress => "in_progress",
            Self::RoundOver => "round_over",
            Self::Ended => "ended",
            Self::Terminated => "terminated",
        }
    }

    /// Check if the game accepts gameplay actions.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    /// Check if the game can never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Terminated)
    }

    /// Check if a new round may be dealt.
    pub fn can_start_round(&self) -> bool {
        matches!(self, Self::WaitingForPlayers | Self::RoundOver)
    }

    /// Apply an event, returning the next status.
    pub fn apply(self, event: StatusEvent) -> Result<Self, InvalidTransition> {
        use GameStatus::*;
        use StatusEvent::*;

        let invalid = |reason: &'static str| InvalidTransition {
            from: self,
            event,
            reason,
        };

        match (self, event) {
            (_, Terminate) => Ok(Terminated),
            (Terminated, _) => Err(invalid("Room was terminated")),
            (Ended, _) => Err(invalid("Game has ended")),

            (WaitingForPlayers | RoundOver, StartRound) => Ok(InProgress),
            (InProgress, StartRound) => Err(invalid("Round already in progress")),

            (InProgress, FinishRound { game_over: false }) => Ok(RoundOver),
            (InProgress, FinishRound { game_over: true }) => Ok(Ended),
            (_, FinishRound { .. }) => Err(invalid("No round in progress")),

            (_, EndSession) => Ok(Ended),
        }
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    StartRound,
    FinishRound { game_over: bool },
    EndSession,
    Terminate,
}

/// Error when a lifecycle transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: GameStatus,
    pub event: StatusEvent,
    pub reason: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid transition from {} via {:?}: {}",
            self.from, self.event, self.reason
        )
    }
}

impl std::error::Error for InvalidTransition {}
