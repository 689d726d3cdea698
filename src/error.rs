//! Error taxonomy.
//!
//! - [`ValidationError`]: an illegal move. Reported to the acting client
//!   only; state is untouched.
//! - [`ActionError::StateConflict`]: the action was based on a stale
//!   sequence number. The client must resync.
//! - [`RoomError`]: join/leave/lookup failures.
//! - [`InternalConsistencyError`]: an invariant broke. Fatal for the room
//!   it happened in, harmless to every other room.

use thiserror::Error;

use crate::state::card::Color;

/// Illegal move.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("game is not in progress")]
    GameNotInProgress,

    #[error("game is already in progress")]
    GameInProgress,

    #[error("player is not seated in this game")]
    UnknownPlayer,

    #[error("it's not your turn")]
    NotYourTurn,

    #[error("card is not in your hand")]
    CardNotInHand,

    #[error("card does not match the discard pile")]
    IllegalCard,

    #[error("only the drawn card may be played now")]
    MustPlayDrawnCard,

    #[error("you must draw or stack on the pending draw")]
    MustResolveDraw,

    #[error("waiting for a color choice")]
    AwaitingColorChoice,

    #[error("no color choice is pending for you")]
    NoColorChoicePending,

    #[error("{0} is not a color that can be declared")]
    InvalidColor(Color),

    #[error("this card needs a target player")]
    TargetRequired,

    #[error("invalid target player")]
    InvalidTarget,

    #[error("you can only pass after drawing")]
    CannotPass,

    #[error("calling uno is only allowed with one or two cards")]
    CannotCallUno,

    #[error("callouts are disabled")]
    CalloutDisabled,

    #[error("that player cannot be called out")]
    NothingToCallOut,

    #[error("not enough players to start")]
    NotEnoughPlayers,
}

/// Room lookup and membership failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("room not found: {0}")]
    NotFound(String),

    #[error("room is full")]
    Full,

    #[error("game has already started")]
    GameAlreadyStarted,

    #[error("already a member of this room")]
    AlreadyJoined,

    #[error("not a member of this room")]
    NotMember,

    #[error("only the host can do that")]
    NotHost,

    #[error("reconnect grace period expired")]
    SessionExpired,

    #[error("no free room code available")]
    CodeSpaceExhausted,

    #[error("room was terminated")]
    Terminated,
}

/// Invariant violation. The owning room is terminated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InternalConsistencyError {
    #[error("both draw and discard piles are empty")]
    DeckExhausted,

    #[error("card count mismatch: expected {expected}, found {actual}")]
    CardCountMismatch { expected: usize, actual: usize },

    #[error("{0} lock was poisoned")]
    LockPoisoned(&'static str),

    #[error("no player holds the turn")]
    NoCurrentPlayer,
}

/// Any reason an action can be refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("stale action based on seq {based_on}, room is at seq {current}")]
    StateConflict { based_on: u64, current: u64 },

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error("internal consistency error: {0}")]
    Internal(#[from] InternalConsistencyError),
}

impl ActionError {
    /// Stable machine-readable reason used in `ActionRejected`.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Validation(e) => match e {
                ValidationError::GameNotInProgress => "game_not_in_progress",
                ValidationError::GameInProgress => "game_in_progress",
                ValidationError::UnknownPlayer => "unknown_player",
                ValidationError::NotYourTurn => "not_your_turn",
                ValidationError::CardNotInHand => "card_not_in_hand",
                ValidationError::IllegalCard => "illegal_card",
                ValidationError::MustPlayDrawnCard => "must_play_drawn_card",
                ValidationError::MustResolveDraw => "must_resolve_draw",
                ValidationError::AwaitingColorChoice => "awaiting_color_choice",
                ValidationError::NoColorChoicePending => "no_color_choice_pending",
                ValidationError::InvalidColor(_) => "invalid_color",
                ValidationError::TargetRequired => "target_required",
                ValidationError::InvalidTarget => "invalid_target",
                ValidationError::CannotPass => "cannot_pass",
                ValidationError::CannotCallUno => "cannot_call_uno",
                ValidationError::CalloutDisabled => "callout_disabled",
                ValidationError::NothingToCallOut => "nothing_to_call_out",
                ValidationError::NotEnoughPlayers => "not_enough_players",
            },
            Self::StateConflict { .. } => "state_conflict",
            Self::Room(e) => match e {
                RoomError::NotFound(_) => "room_not_found",
                RoomError::Full => "room_full",
                RoomError::GameAlreadyStarted => "game_already_started",
                RoomError::AlreadyJoined => "already_joined",
                RoomError::NotMember => "not_member",
                RoomError::NotHost => "not_host",
                RoomError::SessionExpired => "session_expired",
                RoomError::CodeSpaceExhausted => "code_space_exhausted",
                RoomError::Terminated => "room_terminated",
            },
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the room that produced this error must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    /// Whether the client should request a full resync.
    pub fn requires_resync(&self) -> bool {
        matches!(self, Self::StateConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, ActionError>;
