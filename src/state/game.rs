//! Authoritative game state for one room.
//!
//! `GameState` is the single owner of hands, piles and turn order. All
//! mutations go through its public operations; each one validates with
//! [`rules`](super::rules) before touching anything, so a rejected action
//! leaves the state exactly as it was. Accepted operations return one
//! [`Delta`] stamped with the room's next sequence number.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::card::{Card, CardId, CardKind, CardValue, Color};
use super::deck::Deck;
use super::player::{Player, PlayerId, PublicPlayer};
use super::rng::GameRng;
use super::rules::{self, ColorOutcome, HandEffect, PlayKind, Resolution};
use super::settings::GameSettings;
use super::status::{GameStatus, StatusEvent};
use crate::error::{ActionError, InternalConsistencyError, RoomError, ValidationError};

/// Direction of play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Clockwise,
    CounterClockwise,
}

impl Direction {
    /// +1 or -1.
    pub fn sign(&self) -> isize {
        match self {
            Self::Clockwise => 1,
            Self::CounterClockwise => -1,
        }
    }

    pub fn reversed(self) -> Self {
        match self {
            Self::Clockwise => Self::CounterClockwise,
            Self::CounterClockwise => Self::Clockwise,
        }
    }
}

/// Unresolved consequence of the last play that blocks the turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingEffect {
    /// A wild was played without declaring a color.
    ColorChoice {
        player: PlayerId,
        resolution: Resolution,
    },
    /// `target` must draw `amount` (or stack, if enabled).
    ForcedDraw {
        target: PlayerId,
        amount: u32,
        last: CardValue,
    },
}

impl PendingEffect {
    pub fn view(&self) -> PendingView {
        match self {
            Self::ColorChoice { player, .. } => PendingView::AwaitingColorChoice { player_id: *player },
            Self::ForcedDraw { target, amount, .. } => PendingView::AwaitingDrawAck {
                player_id: *target,
                amount: *amount,
            },
        }
    }
}

/// Client-facing description of a pending effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PendingView {
    AwaitingColorChoice { player_id: PlayerId },
    AwaitingDrawAck { player_id: PlayerId, amount: u32 },
}

/// Period during which a player who skipped calling Uno can be caught.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalloutWindow {
    pub target: PlayerId,
    pub deadline: DateTime<Utc>,
}

/// Sub-state of an in-progress round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Settled,
    AwaitingColorChoice,
    AwaitingDrawAck,
    AwaitingCalloutWindow,
}

/// A gameplay request from a seated player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Action {
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
    CallOut { target_player_id: PlayerId },
    ChooseColor { color: Color },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawReason {
    Voluntary,
    Forced,
    Penalty,
    Timeout,
    LateJoin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    ColorChoice,
    ForcedDraw,
    CalloutWindow,
    Turn,
}

/// Compact state summary appended to every delta so clients can verify
/// their reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub status: GameStatus,
    pub phase: Phase,
    pub current_player: Option<PlayerId>,
    pub current_color: Color,
    pub direction: Direction,
    pub top_card: Option<Card>,
    pub draw_pile_size: usize,
    pub hand_sizes: BTreeMap<PlayerId, usize>,
}

/// One observable change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Change {
    PlayerJoined { player: PublicPlayer },
    PlayerLeft { player_id: PlayerId },
    HostChanged { player_id: PlayerId },
    ConnectionChanged { player_id: PlayerId, connected: bool },
    RoundStarted { round: u32, first_card: Card },
    CardPlayed { player_id: PlayerId, card: Card, play: PlayKind },
    CardsDrawn { player_id: PlayerId, count: usize, reason: DrawReason },
    ColorChanged { color: Color },
    DirectionChanged { direction: Direction },
    HandsSwapped { first: PlayerId, second: PlayerId },
    HandsRotated { direction: Direction },
    PendingChanged { pending: Option<PendingView> },
    TurnChanged { player_id: PlayerId },
    DrawnCardPlayable { player_id: PlayerId },
    TurnPassed { player_id: PlayerId },
    UnoCalled { player_id: PlayerId },
    CalloutWindowOpened { target: PlayerId },
    CalloutWindowClosed { target: PlayerId },
    CalledOut { caller: PlayerId, target: PlayerId, penalty: usize },
    TimedOut { player_id: PlayerId, decision: TimeoutKind },
    RoundEnded {
        winner: Option<PlayerId>,
        points: u32,
        scores: BTreeMap<PlayerId, u32>,
    },
    SessionEnded,
    Status(StatusSummary),
}

/// Result of one accepted operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub seq: u64,
    pub changes: Vec<Change>,
    /// New hands of every player whose hand changed. Only sent to owners.
    pub hands: BTreeMap<PlayerId, Vec<Card>>,
}

impl Delta {
    /// The hand update for one viewer, if their hand changed.
    pub fn hand_for(&self, viewer: PlayerId) -> Option<&Vec<Card>> {
        self.hands.get(&viewer)
    }

    /// Winner and scores, if this delta ended a round.
    pub fn round_result(&self) -> Option<(Option<PlayerId>, &BTreeMap<PlayerId, u32>)> {
        self.changes.iter().find_map(|c| match c {
            Change::RoundEnded { winner, scores, .. } => Some((*winner, scores)),
            _ => None,
        })
    }
}

/// Full state as seen by one player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameView {
    pub room_code: String,
    pub status: GameStatus,
    pub phase: Phase,
    pub round: u32,
    pub seq: u64,
    pub players: Vec<PublicPlayer>,
    pub your_hand: Vec<Card>,
    pub top_card: Option<Card>,
    pub current_color: Color,
    pub current_player: Option<PlayerId>,
    pub direction: Direction,
    pub draw_pile_size: usize,
    pub pending: Option<PendingView>,
    pub callout_target: Option<PlayerId>,
    pub drawn_card: Option<CardId>,
    pub scores: BTreeMap<PlayerId, u32>,
    pub settings: GameSettings,
}

#[derive(Debug, Default)]
struct DeltaBuilder {
    changes: Vec<Change>,
    touched: BTreeSet<PlayerId>,
}

impl DeltaBuilder {
    fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    fn touch(&mut self, player: PlayerId) {
        self.touched.insert(player);
    }
}

/// Game state for one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    pub room_code: String,
    pub status: GameStatus,
    pub settings: GameSettings,
    players: Vec<Player>,
    deck: Deck,
    current_index: usize,
    direction: Direction,
    current_color: Color,
    pending: Option<PendingEffect>,
    callout: Option<CalloutWindow>,
    /// Card the current player just drew and may still play.
    drawn_card: Option<CardId>,
    scores: BTreeMap<PlayerId, u32>,
    round: u32,
    seq: u64,
    /// Sequence number at which the current decision point was created.
    decision_seq: u64,
    deck_size: usize,
    decision_deadline: Option<DateTime<Utc>>,
    turn_deadline: Option<DateTime<Utc>>,
    rng: GameRng,
}

impl GameState {
    /// Create an empty game waiting for players.
    pub fn new(room_code: impl Into<String>, settings: GameSettings, rng: GameRng) -> Self {
        Self {
            room_code: room_code.into(),
            status: GameStatus::WaitingForPlayers,
            settings,
            players: Vec::new(),
            deck: Deck::empty(),
            current_index: 0,
            direction: Direction::Clockwise,
            current_color: Color::Red,
            pending: None,
            callout: None,
            drawn_card: None,
            scores: BTreeMap::new(),
            round: 0,
            seq: 0,
            decision_seq: 0,
            deck_size: 0,
            decision_deadline: None,
            turn_deadline: None,
            rng,
        }
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn player(&self, id: PlayerId) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }

    pub fn seat_of(&self, id: PlayerId) -> Option<usize> {
        self.players.iter().position(|p| p.id == id)
    }

    pub fn has_player(&self, id: PlayerId) -> bool {
        self.seat_of(id).is_some()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn host_id(&self) -> Option<PlayerId> {
        self.players.iter().find(|p| p.is_host).map(|p| p.id)
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Player whose turn it is. `None` outside a round.
    pub fn current_player_id(&self) -> Option<PlayerId> {
        if !self.status.is_active() {
            return None;
        }
        self.players.get(self.current_index).map(|p| p.id)
    }

    pub fn is_player_turn(&self, id: PlayerId) -> bool {
        self.current_player_id() == Some(id)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn current_color(&self) -> Color {
        self.current_color
    }

    pub fn top_card(&self) -> Option<&Card> {
        self.deck.top()
    }

    pub fn draw_pile_size(&self) -> usize {
        self.deck.draw_pile_len()
    }

    pub fn pending(&self) -> Option<&PendingEffect> {
        self.pending.as_ref()
    }

    pub fn callout(&self) -> Option<&CalloutWindow> {
        self.callout.as_ref()
    }

    pub fn drawn_card(&self) -> Option<CardId> {
        self.drawn_card
    }

    pub fn scores(&self) -> &BTreeMap<PlayerId, u32> {
        &self.scores
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn decision_seq(&self) -> u64 {
        self.decision_seq
    }

    pub fn deck_size(&self) -> usize {
        self.deck_size
    }

    pub fn phase(&self) -> Phase {
        match (&self.pending, &self.callout) {
            (Some(PendingEffect::ColorChoice { .. }), _) => Phase::AwaitingColorChoice,
            (Some(PendingEffect::ForcedDraw { .. }), _) => Phase::AwaitingDrawAck,
            (None, Some(_)) => Phase::AwaitingCalloutWindow,
            (None, None) => Phase::Settled,
        }
    }

    /// Player who must act next, including pending decisions.
    pub fn decision_owner(&self) -> Option<PlayerId> {
        match &self.pending {
            Some(PendingEffect::ColorChoice { player, .. }) => Some(*player),
            Some(PendingEffect::ForcedDraw { target, .. }) => Some(*target),
            None => self.current_player_id(),
        }
    }

    /// Earliest deadline `force_advance` would act on.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        if !self.status.is_active() {
            return None;
        }
        [
            self.decision_deadline,
            self.callout.as_ref().map(|w| w.deadline),
            self.turn_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Cards across all hands plus both piles.
    pub fn card_count(&self) -> usize {
        self.players.iter().map(Player::hand_size).sum::<usize>() + self.deck.len()
    }

    /// Verify the round's invariants.
    pub fn check_invariants(&self) -> Result<(), InternalConsistencyError> {
        if matches!(self.status, GameStatus::InProgress | GameStatus::RoundOver) {
            let actual = self.card_count();
            if actual != self.deck_size {
                return Err(InternalConsistencyError::CardCountMismatch {
                    expected: self.deck_size,
                    actual,
                });
            }
        }
        if self.status.is_active() && self.players.get(self.current_index).is_none() {
            return Err(InternalConsistencyError::NoCurrentPlayer);
        }
        Ok(())
    }

    pub fn summary(&self) -> StatusSummary {
        StatusSummary {
            status: self.status,
            phase: self.phase(),
            current_player: self.current_player_id(),
            current_color: self.current_color,
            direction: self.direction,
            top_card: self.deck.top().copied(),
            draw_pile_size: self.deck.draw_pile_len(),
            hand_sizes: self
                .players
                .iter()
                .map(|p| (p.id, p.hand_size()))
                .collect(),
        }
    }

    /// Full state as seen by `viewer`. Other hands appear only as counts.
    pub fn view_for(&self, viewer: PlayerId) -> GameView {
        let current = self.current_player_id();
        let players = self
            .players
            .iter()
            .map(|p| PublicPlayer {
                is_current_turn: Some(p.id) == current,
                ..p.public_view()
            })
            .collect();
        let your_hand = self
            .player(viewer)
            .map(|p| p.hand().to_vec())
            .unwrap_or_default();
        let drawn_card = self.drawn_card.filter(|_| current == Some(viewer));

        GameView {
            room_code: self.room_code.clone(),
            status: self.status,
            phase: self.phase(),
            round: self.round,
            seq: self.seq,
            players,
            your_hand,
            top_card: self.deck.top().copied(),
            current_color: self.current_color,
            current_player: current,
            direction: self.direction,
            draw_pile_size: self.deck.draw_pile_len(),
            pending: self.pending.as_ref().map(PendingEffect::view),
            callout_target: self.callout.as_ref().map(|w| w.target),
            drawn_card,
            scores: self.scores.clone(),
            settings: self.settings.clone(),
        }
    }

    /// Seat a player. Mid-round joins are dealt a fresh hand when allowed.
    pub fn add_player(&mut self, mut player: Player, allow_late_join: bool) -> Result<Delta, ActionError> {
        if self.has_player(player.id) {
            return Err(RoomError::AlreadyJoined.into());
        }
        let mut b = DeltaBuilder::default();

        match self.status {
            GameStatus::WaitingForPlayers | GameStatus::RoundOver => {}
            GameStatus::InProgress if allow_late_join => {
                let cards = self.deck.draw_up_to(self.settings.hand_size, &mut self.rng);
                b.push(Change::CardsDrawn {
                    player_id: player.id,
                    count: cards.len(),
                    reason: DrawReason::LateJoin,
                });
                player.give_cards(cards);
                b.touch(player.id);
            }
            GameStatus::InProgress => return Err(RoomError::GameAlreadyStarted.into()),
            GameStatus::Ended | GameStatus::Terminated => return Err(RoomError::Terminated.into()),
        }

        if self.players.is_empty() {
            player.is_host = true;
        }
        self.scores.entry(player.id).or_insert(0);
        b.push(Change::PlayerJoined {
            player: player.public_view(),
        });
        self.players.push(player);

        Ok(self.commit(b, false)?)
    }

    /// Remove a player, returning their cards to the discard pile and
    /// handing their obligations and the turn onward.
    pub fn remove_player(&mut self, id: PlayerId, now: DateTime<Utc>) -> Result<Delta, ActionError> {
        let idx = self.seat_of(id).ok_or(RoomError::NotMember)?;
        let mut b = DeltaBuilder::default();
        let was_host = self.players[idx].is_host;

        if self.status.is_active() {
            let was_current = idx == self.current_index;
            let owned_pending = self.pending.is_some() && self.decision_owner() == Some(id);
            if owned_pending {
                self.set_pending(None, now, &mut b);
            }
            if self.callout.as_ref().map(|w| w.target) == Some(id) {
                self.close_callout(&mut b);
            }

            let next_id = self.players[rules::step(idx, self.direction, 1, self.players.len())].id;
            let cards = self.players[idx].take_hand();
            self.deck.bury(cards);
            self.players.remove(idx);
            b.push(Change::PlayerLeft { player_id: id });

            if self.players.len() == 1 {
                let winner = self.players[0].id;
                self.current_index = 0;
                self.finish_round(Some(winner), &mut b)?;
            } else if was_current {
                let next = self.seat_of(next_id).unwrap_or(0);
                self.set_current(next, now, &mut b);
            } else if idx < self.current_index {
                self.current_index -= 1;
            }
        } else {
            let cards = self.players[idx].take_hand();
            self.deck.bury(cards);
            self.players.remove(idx);
            b.push(Change::PlayerLeft { player_id: id });
            self.current_index = 0;
        }
        self.scores.remove(&id);

        if was_host {
            if let Some(new_host) = self.players.first_mut() {
                new_host.is_host = true;
                b.push(Change::HostChanged {
                    player_id: new_host.id,
                });
            }
        }

        let decision = self.status.is_active();
        Ok(self.commit(b, decision)?)
    }

    /// Update a seat's connection flag. Returns `None` when unchanged.
    pub fn set_connected(&mut self, id: PlayerId, connected: bool) -> Result<Option<Delta>, ActionError> {
        let player = self
            .players
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(RoomError::NotMember)?;
        if player.is_connected == connected {
            return Ok(None);
        }
        player.is_connected = connected;

        let mut b = DeltaBuilder::default();
        b.push(Change::ConnectionChanged {
            player_id: id,
            connected,
        });
        Ok(Some(self.commit(b, false)?))
    }

    /// Clear a seat's connection flag without committing. Used when
    /// rebuilding a room, where the persisted sequence must not move.
    pub(crate) fn mark_disconnected(&mut self, id: PlayerId) {
        if let Some(player) = self.players.iter_mut().find(|p| p.id == id) {
            player.is_connected = false;
        }
    }

    /// Deal a new round to the seated players.
    pub fn start_round(&mut self, settings: GameSettings, now: DateTime<Utc>) -> Result<Delta, ActionError> {
        if self.status.is_active() {
            return Err(ValidationError::GameInProgress.into());
        }
        if !self.status.can_start_round() {
            return Err(RoomError::Terminated.into());
        }
        if self.players.len() < 2 {
            return Err(ValidationError::NotEnoughPlayers.into());
        }

        self.settings = settings.normalized(self.players.len());
        let composition = self.settings.composition();
        self.deck_size = composition.size();
        self.deck = Deck::new(composition.build(), &mut self.rng);

        let mut b = DeltaBuilder::default();
        for i in 0..self.players.len() {
            let hand = self.deck.draw(self.settings.hand_size, &mut self.rng)?;
            let player = &mut self.players[i];
            player.replace_hand(hand);
            b.touch(player.id);
        }

        let first_card = self.flip_first_card()?;
        self.current_color = first_card.color();
        self.direction = Direction::Clockwise;
        self.pending = None;
        self.callout = None;
        self.drawn_card = None;
        self.decision_deadline = None;
        self.round += 1;
        self.status = self
            .status
            .apply(StatusEvent::StartRound)
            .map_err(|_| ValidationError::GameInProgress)?;

        b.push(Change::RoundStarted {
            round: self.round,
            first_card,
        });
        let first_seat = (self.round as usize - 1) % self.players.len();
        self.set_current(first_seat, now, &mut b);

        tracing::info!(
            room = %self.room_code,
            round = self.round,
            players = self.players.len(),
            "round started"
        );
        Ok(self.commit(b, true)?)
    }

    /// The first discard must be a number card; anything else goes back
    /// into the draw pile at a random position.
    fn flip_first_card(&mut self) -> Result<Card, InternalConsistencyError> {
        for _ in 0..self.deck_size * 4 {
            let card = self.deck.draw_one(&mut self.rng)?;
            if card.kind() == CardKind::Number {
                self.deck.discard(card);
                return Ok(card);
            }
            self.deck.return_to_draw_pile(card, &mut self.rng);
        }
        Err(InternalConsistencyError::DeckExhausted)
    }

    /// Abort the current round without a winner.
    pub fn end_round(&mut self) -> Result<Delta, ActionError> {
        if !self.status.is_active() {
            return Err(ValidationError::GameNotInProgress.into());
        }
        let mut b = DeltaBuilder::default();
        self.finish_round(None, &mut b)?;
        Ok(self.commit(b, true)?)
    }

    /// End the whole session.
    pub fn end_session(&mut self) -> Result<Delta, ActionError> {
        self.status = self
            .status
            .apply(StatusEvent::EndSession)
            .map_err(|_| RoomError::Terminated)?;
        self.clear_decisions();
        let mut b = DeltaBuilder::default();
        b.push(Change::SessionEnded);
        Ok(self.commit(b, true)?)
    }

    /// Mark the game as unusable after an internal failure.
    pub fn terminate(&mut self) {
        if let Ok(status) = self.status.apply(StatusEvent::Terminate) {
            self.status = status;
        }
        self.clear_decisions();
    }

    /// Validate and apply one action atomically.
    pub fn submit_action(
        &mut self,
        player_id: PlayerId,
        action: Action,
        now: DateTime<Utc>,
    ) -> Result<Delta, ActionError> {
        if !self.status.is_active() {
            return Err(ValidationError::GameNotInProgress.into());
        }
        if !self.has_player(player_id) {
            return Err(ValidationError::UnknownPlayer.into());
        }

        match action {
            Action::PlayCard {
                card_id,
                declared_color,
                target_player_id,
            } => self.play_card(player_id, card_id, declared_color, target_player_id, now),
            Action::DrawCard => self.draw_card(player_id, now),
            Action::PassTurn => self.pass_turn(player_id, now),
            Action::CallUno => self.call_uno(player_id),
            Action::CallOut { target_player_id } => self.call_out(player_id, target_player_id, now),
            Action::ChooseColor { color } => self.choose_color(player_id, color, now),
        }
    }

    /// Like `submit_action`, but rejects actions based on a sequence number
    /// older than the current decision point.
    pub fn submit_action_at(
        &mut self,
        player_id: PlayerId,
        action: Action,
        based_on_seq: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<Delta, ActionError> {
        if let Some(based_on) = based_on_seq {
            if based_on < self.decision_seq || based_on > self.seq {
                return Err(ActionError::StateConflict {
                    based_on,
                    current: self.seq,
                });
            }
        }
        self.submit_action(player_id, action, now)
    }

    fn play_card(
        &mut self,
        actor: PlayerId,
        card_id: CardId,
        declared_color: Option<Color>,
        target: Option<PlayerId>,
        now: DateTime<Utc>,
    ) -> Result<Delta, ActionError> {
        let (card, kind) = rules::check_play(self, actor, card_id)?;
        let target = rules::resolve_target(self, actor, &card, target)?;
        let resolution = rules::resolve_play(self, actor, card, kind, declared_color, target)?;

        let mut b = DeltaBuilder::default();
        self.close_callout_on_action(actor, &mut b);
        self.apply_play(resolution, now, &mut b)?;
        Ok(self.commit(b, true)?)
    }

    fn apply_play(
        &mut self,
        res: Resolution,
        now: DateTime<Utc>,
        b: &mut DeltaBuilder,
    ) -> Result<(), InternalConsistencyError> {
        let actor = res.actor;
        let idx = self
            .seat_of(actor)
            .ok_or(InternalConsistencyError::NoCurrentPlayer)?;

        self.current_index = idx;
        self.drawn_card = None;
        if res.kind == PlayKind::Stack {
            self.pending = None;
            self.decision_deadline = None;
        }

        let card = self.players[idx]
            .take_card(res.card.id())
            .ok_or_else(|| InternalConsistencyError::CardCountMismatch {
                expected: self.deck_size,
                actual: self.card_count(),
            })?;
        self.deck.discard(card);
        b.touch(actor);
        b.push(Change::CardPlayed {
            player_id: actor,
            card,
            play: res.kind,
        });

        if rules::check_win(self, actor) {
            if let ColorOutcome::Set(color) = res.color {
                self.set_color(color, b);
            }
            return self.finish_round(Some(actor), b);
        }

        match res.hand_effect {
            Some(HandEffect::Swap { with }) => self.swap_hands(actor, with, b),
            Some(HandEffect::Rotate) => self.rotate_hands(b),
            None => {}
        }

        if res.color == ColorOutcome::Choose {
            self.set_pending(
                Some(PendingEffect::ColorChoice {
                    player: actor,
                    resolution: res,
                }),
                now,
                b,
            );
            self.maybe_open_callout(actor, now, b);
            return Ok(());
        }

        self.finish_resolution(res, now, b)
    }

    /// Apply color, direction and turn effects once no choice is pending.
    fn finish_resolution(
        &mut self,
        res: Resolution,
        now: DateTime<Utc>,
        b: &mut DeltaBuilder,
    ) -> Result<(), InternalConsistencyError> {
        if let ColorOutcome::Set(color) = res.color {
            self.set_color(color, b);
        }
        if res.reverses {
            self.direction = self.direction.reversed();
            b.push(Change::DirectionChanged {
                direction: self.direction,
            });
        }

        let idx = self
            .seat_of(res.actor)
            .ok_or(InternalConsistencyError::NoCurrentPlayer)?;
        let count = self.players.len();

        if res.draw_penalty > 0 {
            let target_idx = rules::step(idx, self.direction, 1, count);
            let target = self.players[target_idx].id;
            self.set_current(target_idx, now, b);
            self.set_pending(
                Some(PendingEffect::ForcedDraw {
                    target,
                    amount: res.draw_penalty,
                    last: res.card.value(),
                }),
                now,
                b,
            );
        } else {
            let next = rules::next_turn_index(idx, self.direction, res.skip, count);
            self.set_current(next, now, b);
        }

        self.maybe_open_callout(res.actor, now, b);
        Ok(())
    }

    fn choose_color(&mut self, player: PlayerId, color: Color, now: DateTime<Utc>) -> Result<Delta, ActionError> {
        match &self.pending {
            Some(PendingEffect::ColorChoice { player: chooser, .. }) if *chooser == player => {}
            _ => return Err(ValidationError::NoColorChoicePending.into()),
        }
        if color.is_wild() {
            return Err(ValidationError::InvalidColor(color).into());
        }

        let mut b = DeltaBuilder::default();
        self.resolve_color_choice(color, now, &mut b)?;
        Ok(self.commit(b, true)?)
    }

    fn resolve_color_choice(
        &mut self,
        color: Color,
        now: DateTime<Utc>,
        b: &mut DeltaBuilder,
    ) -> Result<(), InternalConsistencyError> {
        let Some(PendingEffect::ColorChoice { mut resolution, .. }) = self.pending.take() else {
            return Ok(());
        };
        self.decision_deadline = None;
        b.push(Change::PendingChanged { pending: None });
        resolution.color = ColorOutcome::Set(color);
        self.finish_resolution(resolution, now, b)
    }

    fn draw_card(&mut self, player: PlayerId, now: DateTime<Utc>) -> Result<Delta, ActionError> {
        match &self.pending {
            Some(PendingEffect::ColorChoice { .. }) => {
                return Err(ValidationError::AwaitingColorChoice.into());
            }
            Some(PendingEffect::ForcedDraw { target, .. }) if *target != player => {
                return Err(ValidationError::NotYourTurn.into());
            }
            Some(PendingEffect::ForcedDraw { .. }) => {
                let mut b = DeltaBuilder::default();
                self.close_callout_on_action(player, &mut b);
                self.resolve_forced_draw(DrawReason::Forced, now, &mut b)?;
                return Ok(self.commit(b, true)?);
            }
            None => {}
        }

        if !self.is_player_turn(player) {
            return Err(ValidationError::NotYourTurn.into());
        }
        if self.drawn_card.is_some() {
            return Err(ValidationError::MustPlayDrawnCard.into());
        }

        let mut b = DeltaBuilder::default();
        self.close_callout_on_action(player, &mut b);
        self.voluntary_draw(player, now, &mut b)?;
        Ok(self.commit(b, true)?)
    }

    fn resolve_forced_draw(
        &mut self,
        reason: DrawReason,
        now: DateTime<Utc>,
        b: &mut DeltaBuilder,
    ) -> Result<(), InternalConsistencyError> {
        let Some(PendingEffect::ForcedDraw { target, amount, .. }) = self.pending.clone() else {
            return Ok(());
        };
        self.set_pending(None, now, b);
        self.draw_into(target, amount as usize, reason, b);

        let idx = self
            .seat_of(target)
            .ok_or(InternalConsistencyError::NoCurrentPlayer)?;
        let next = rules::step(idx, self.direction, 1, self.players.len());
        self.set_current(next, now, b);
        Ok(())
    }

    fn voluntary_draw(
        &mut self,
        player: PlayerId,
        now: DateTime<Utc>,
        b: &mut DeltaBuilder,
    ) -> Result<(), InternalConsistencyError> {
        let idx = self
            .seat_of(player)
            .ok_or(InternalConsistencyError::NoCurrentPlayer)?;

        let mut count = 0;
        let mut last = None;
        while self.deck.can_draw() {
            let card = self.deck.draw_one(&mut self.rng)?;
            self.players[idx].give_cards([card]);
            count += 1;
            let playable = rules::matches_top(self, &card);
            last = Some((card, playable));
            if playable || !self.settings.draw_until_match {
                break;
            }
        }
        b.touch(player);
        b.push(Change::CardsDrawn {
            player_id: player,
            count,
            reason: DrawReason::Voluntary,
        });

        match last {
            Some((card, true)) if self.settings.force_play => {
                let target = rules::default_swap_target(self, player);
                let target = rules::resolve_target(self, player, &card, target).unwrap_or(None);
                let resolution = rules::resolve_play(self, player, card, PlayKind::Turn, None, target)
                    .map_err(|_| InternalConsistencyError::NoCurrentPlayer)?;
                self.apply_play(resolution, now, b)
            }
            Some((card, true)) if self.settings.play_drawn_card => {
                self.drawn_card = Some(card.id());
                self.turn_deadline = Some(now + self.settings.game_speed.turn_timeout());
                b.push(Change::DrawnCardPlayable { player_id: player });
                Ok(())
            }
            _ => {
                let next = rules::next_turn_index(idx, self.direction, 0, self.players.len());
                self.set_current(next, now, b);
                Ok(())
            }
        }
    }

    fn pass_turn(&mut self, player: PlayerId, now: DateTime<Utc>) -> Result<Delta, ActionError> {
        match &self.pending {
            Some(PendingEffect::ColorChoice { .. }) => return Err(ValidationError::AwaitingColorChoice.into()),
            Some(PendingEffect::ForcedDraw { .. }) => return Err(ValidationError::MustResolveDraw.into()),
            None => {}
        }
        if !self.is_player_turn(player) {
            return Err(ValidationError::NotYourTurn.into());
        }
        if self.drawn_card.is_none() {
            return Err(ValidationError::CannotPass.into());
        }

        let mut b = DeltaBuilder::default();
        self.close_callout_on_action(player, &mut b);
        self.pass_from_current(now, &mut b);
        Ok(self.commit(b, true)?)
    }

    fn pass_from_current(&mut self, now: DateTime<Utc>, b: &mut DeltaBuilder) {
        let player = self.players[self.current_index].id;
        self.drawn_card = None;
        b.push(Change::TurnPassed { player_id: player });
        let next = rules::next_turn_index(self.current_index, self.direction, 0, self.players.len());
        self.set_current(next, now, b);
    }

    fn call_uno(&mut self, player: PlayerId) -> Result<Delta, ActionError> {
        let size = self
            .player(player)
            .map(Player::hand_size)
            .ok_or(ValidationError::UnknownPlayer)?;
        if !(1..=2).contains(&size) {
            return Err(ValidationError::CannotCallUno.into());
        }

        let mut b = DeltaBuilder::default();
        if let Some(p) = self.players.iter_mut().find(|p| p.id == player) {
            p.uno_declared = true;
        }
        b.push(Change::UnoCalled { player_id: player });
        if self.callout.as_ref().map(|w| w.target) == Some(player) {
            self.close_callout(&mut b);
        }
        Ok(self.commit(b, false)?)
    }

    fn call_out(&mut self, caller: PlayerId, target: PlayerId, now: DateTime<Utc>) -> Result<Delta, ActionError> {
        rules::check_callout(self, caller, target, now)?;

        let mut b = DeltaBuilder::default();
        self.callout = None;
        let penalty = self.draw_into(target, self.settings.uno_penalty, DrawReason::Penalty, &mut b);
        b.push(Change::CalledOut {
            caller,
            target,
            penalty,
        });
        tracing::debug!(room = %self.room_code, %caller, %target, penalty, "uno callout");
        Ok(self.commit(b, false)?)
    }

    /// Resolve the earliest expired deadline with its default outcome.
    /// Returns `None` when nothing has expired.
    pub fn force_advance(&mut self, now: DateTime<Utc>) -> Result<Option<Delta>, ActionError> {
        if !self.status.is_active() {
            return Ok(None);
        }
        let mut b = DeltaBuilder::default();

        if self.decision_deadline.map_or(false, |d| now >= d) {
            match self.pending.clone() {
                Some(PendingEffect::ColorChoice { player, .. }) => {
                    let color = rules::least_held_color(self.player(player));
                    b.push(Change::TimedOut {
                        player_id: player,
                        decision: TimeoutKind::ColorChoice,
                    });
                    self.resolve_color_choice(color, now, &mut b)?;
                }
                Some(PendingEffect::ForcedDraw { target, .. }) => {
                    b.push(Change::TimedOut {
                        player_id: target,
                        decision: TimeoutKind::ForcedDraw,
                    });
                    self.close_callout_on_action(target, &mut b);
                    self.resolve_forced_draw(DrawReason::Timeout, now, &mut b)?;
                }
                None => {
                    self.decision_deadline = None;
                    return Ok(None);
                }
            }
            tracing::debug!(room = %self.room_code, "pending decision timed out");
            return Ok(Some(self.commit(b, true)?));
        }

        if let Some(window) = self.callout.clone() {
            if now >= window.deadline {
                b.push(Change::TimedOut {
                    player_id: window.target,
                    decision: TimeoutKind::CalloutWindow,
                });
                self.close_callout(&mut b);
                return Ok(Some(self.commit(b, false)?));
            }
        }

        if self.turn_deadline.map_or(false, |d| now >= d) {
            let player = self.players[self.current_index].id;
            b.push(Change::TimedOut {
                player_id: player,
                decision: TimeoutKind::Turn,
            });
            self.close_callout_on_action(player, &mut b);
            if self.drawn_card.is_none() {
                self.draw_into(player, 1, DrawReason::Timeout, &mut b);
            }
            self.pass_from_current(now, &mut b);
            tracing::debug!(room = %self.room_code, %player, "turn timed out");
            return Ok(Some(self.commit(b, true)?));
        }

        Ok(None)
    }

    fn set_current(&mut self, index: usize, now: DateTime<Utc>, b: &mut DeltaBuilder) {
        self.current_index = index;
        self.drawn_card = None;
        self.turn_deadline = Some(now + self.settings.game_speed.turn_timeout());
        b.push(Change::TurnChanged {
            player_id: self.players[index].id,
        });
    }

    fn set_pending(&mut self, pending: Option<PendingEffect>, now: DateTime<Utc>, b: &mut DeltaBuilder) {
        self.decision_deadline = pending
            .as_ref()
            .map(|_| now + self.settings.game_speed.decision_timeout());
        b.push(Change::PendingChanged {
            pending: pending.as_ref().map(PendingEffect::view),
        });
        self.pending = pending;
    }

    fn set_color(&mut self, color: Color, b: &mut DeltaBuilder) {
        if self.current_color != color {
            self.current_color = color;
            b.push(Change::ColorChanged { color });
        }
    }

    fn draw_into(&mut self, player: PlayerId, n: usize, reason: DrawReason, b: &mut DeltaBuilder) -> usize {
        let cards = self.deck.draw_up_to(n, &mut self.rng);
        let count = cards.len();
        if let Some(p) = self.players.iter_mut().find(|p| p.id == player) {
            p.give_cards(cards);
        }
        b.touch(player);
        b.push(Change::CardsDrawn {
            player_id: player,
            count,
            reason,
        });
        count
    }

    fn swap_hands(&mut self, first: PlayerId, second: PlayerId, b: &mut DeltaBuilder) {
        let (Some(i), Some(j)) = (self.seat_of(first), self.seat_of(second)) else {
            return;
        };
        let a = self.players[i].take_hand();
        let c = self.players[j].take_hand();
        self.players[i].replace_hand(c);
        self.players[j].replace_hand(a);
        b.touch(first);
        b.touch(second);
        b.push(Change::HandsSwapped { first, second });
    }

    /// Every hand moves one seat in the direction of play.
    fn rotate_hands(&mut self, b: &mut DeltaBuilder) {
        let count = self.players.len();
        let hands: Vec<Vec<Card>> = self.players.iter_mut().map(Player::take_hand).collect();
        for (i, hand) in hands.into_iter().enumerate() {
            let receiver = rules::step(i, self.direction, 1, count);
            self.players[receiver].replace_hand(hand);
        }
        for p in &self.players {
            b.touch(p.id);
        }
        b.push(Change::HandsRotated {
            direction: self.direction,
        });
    }

    fn maybe_open_callout(&mut self, player: PlayerId, now: DateTime<Utc>, b: &mut DeltaBuilder) {
        if self.settings.challenge_rule && rules::must_call_uno(self, player) {
            self.callout = Some(CalloutWindow {
                target: player,
                deadline: now + self.settings.game_speed.decision_timeout(),
            });
            b.push(Change::CalloutWindowOpened { target: player });
        }
    }

    /// A turn action by anyone but the window's target closes the window.
    fn close_callout_on_action(&mut self, actor: PlayerId, b: &mut DeltaBuilder) {
        if self.callout.as_ref().map_or(false, |w| w.target != actor) {
            self.close_callout(b);
        }
    }

    fn close_callout(&mut self, b: &mut DeltaBuilder) {
        if let Some(window) = self.callout.take() {
            b.push(Change::CalloutWindowClosed {
                target: window.target,
            });
        }
    }

    fn clear_decisions(&mut self) {
        self.pending = None;
        self.callout = None;
        self.drawn_card = None;
        self.decision_deadline = None;
        self.turn_deadline = None;
    }

    fn finish_round(&mut self, winner: Option<PlayerId>, b: &mut DeltaBuilder) -> Result<(), InternalConsistencyError> {
        let mut points = 0;
        let mut game_over = false;
        if let Some(winner) = winner {
            points = self
                .players
                .iter()
                .filter(|p| p.id != winner)
                .map(Player::hand_points)
                .sum();
            let total = self.scores.entry(winner).or_insert(0);
            *total += points;
            game_over = self.settings.target_score.map_or(false, |t| *total >= t);
        }

        self.status = self
            .status
            .apply(StatusEvent::FinishRound { game_over })
            .map_err(|_| InternalConsistencyError::NoCurrentPlayer)?;
        self.clear_decisions();

        b.push(Change::RoundEnded {
            winner,
            points,
            scores: self.scores.clone(),
        });
        tracing::info!(
            room = %self.room_code,
            round = self.round,
            winner = ?winner,
            points,
            game_over,
            "round ended"
        );
        Ok(())
    }

    fn commit(&mut self, b: DeltaBuilder, decision: bool) -> Result<Delta, InternalConsistencyError> {
        if let Err(err) = self.check_invariants() {
            tracing::error!(room = %self.room_code, error = %err, "invariant violated");
            return Err(err);
        }

        self.seq += 1;
        if decision {
            self.decision_seq = self.seq;
        }

        let hands = b
            .touched
            .into_iter()
            .filter_map(|id| self.player(id).map(|p| (id, p.hand().to_vec())))
            .collect();
        let mut changes = b.changes;
        changes.push(Change::Status(self.summary()));

        Ok(Delta {
            seq: self.seq,
            changes,
            hands,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::card::DeckComposition;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn game_with(n: u64, settings: GameSettings) -> GameState {
        let mut game = GameState::new("ROOM42", settings.clone(), GameRng::new(7));
        for i in 1..=n {
            game.add_player(Player::new(PlayerId(i), format!("P{}", i)), false)
                .unwrap();
        }
        game.start_round(settings, t0()).unwrap();
        game
    }

    /// Replace hands and discard top with exact cards while keeping the
    /// card count consistent with the deck composition.
    fn rig(game: &mut GameState, hands: &[Vec<(Color, CardValue)>], top: (Color, CardValue)) {
        rig_with_draws(game, hands, top, &[]);
    }

    /// Like `rig`, with `draws` stacked on the draw pile in draw order.
    fn rig_with_draws(
        game: &mut GameState,
        hands: &[Vec<(Color, CardValue)>],
        top: (Color, CardValue),
        draws: &[(Color, CardValue)],
    ) {
        let mut pool = game.settings.composition().build();
        let mut take = |(color, value): (Color, CardValue)| {
            let pos = pool
                .iter()
                .position(|c| c.color() == color && c.value() == value)
                .expect("card available in deck");
            pool.remove(pos)
        };
        let top = take(top);
        let dealt: Vec<Vec<Card>> = hands
            .iter()
            .map(|h| h.iter().map(|spec| take(*spec)).collect())
            .collect();
        let stacked: Vec<Card> = draws.iter().map(|spec| take(*spec)).collect();
        for (player, hand) in game.players.iter_mut().zip(dealt) {
            player.replace_hand(hand);
        }
        pool.extend(stacked.into_iter().rev());
        game.deck = Deck::from_piles(pool, vec![top]);
        game.current_color = if top.is_wild() { Color::Red } else { top.color() };
        game.current_index = 0;
        game.direction = Direction::Clockwise;
        game.pending = None;
        game.callout = None;
        game.drawn_card = None;
        game.decision_deadline = None;
        game.turn_deadline = Some(t0() + game.settings.game_speed.turn_timeout());
        game.check_invariants().unwrap();
    }

    fn card_id(game: &GameState, player: u64, color: Color, value: CardValue) -> CardId {
        game.player(PlayerId(player))
            .unwrap()
            .hand()
            .iter()
            .find(|c| c.color() == color && c.value() == value)
            .map(|c| c.id())
            .unwrap()
    }

    fn play(game: &mut GameState, player: u64, color: Color, value: CardValue) -> Result<Delta, ActionError> {
        let card_id = card_id(game, player, color, value);
        game.submit_action(
            PlayerId(player),
            Action::PlayCard {
                card_id,
                declared_color: None,
                target_player_id: None,
            },
            t0(),
        )
    }

    use CardValue::{Blank, DrawTwo, Number, Reverse, Skip, SwapHands, WildDrawFour};
    use Color::{Blue, Green, Red, Wild, Yellow};

    /// Two unplayable cards on a red discard. Use a distinct `n` per hand.
    fn filler(n: u8) -> Vec<(Color, CardValue)> {
        vec![(Green, Number(n)), (Yellow, Number(n))]
    }

    #[test]
    fn test_start_round_deals_hands() {
        let game = game_with(3, GameSettings::default());
        assert_eq!(game.status, GameStatus::InProgress);
        for p in game.players() {
            assert_eq!(p.hand_size(), 7);
        }
        assert_eq!(game.card_count(), DeckComposition::default().size());
        assert_eq!(game.top_card().unwrap().kind(), CardKind::Number);
        assert_eq!(game.current_player_id(), Some(PlayerId(1)));
        assert!(!game.current_color().is_wild());
    }

    #[test]
    fn test_start_requires_two_players() {
        let mut game = GameState::new("ROOM", GameSettings::default(), GameRng::new(1));
        game.add_player(Player::new(PlayerId(1), "A"), false).unwrap();
        let err = game.start_round(GameSettings::default(), t0()).unwrap_err();
        assert_eq!(err, ActionError::Validation(ValidationError::NotEnoughPlayers));
    }

    #[test]
    fn test_same_seed_same_deal() {
        let a = game_with(4, GameSettings::default());
        let b = game_with(4, GameSettings::default());
        assert_eq!(a.players()[2].hand(), b.players()[2].hand());
        assert_eq!(a.top_card(), b.top_card());
    }

    #[test]
    fn test_number_play_advances_turn() {
        let mut game = game_with(3, GameSettings::default());
        rig(&mut game, &[vec![(Red, Number(5)), (Blue, Number(1))], filler(3), filler(4)], (Red, Number(2)));

        let delta = play(&mut game, 1, Red, Number(5)).unwrap();
        assert_eq!(game.current_player_id(), Some(PlayerId(2)));
        assert_eq!(game.top_card().unwrap().value(), Number(5));
        assert!(delta.hands.contains_key(&PlayerId(1)));
        assert!(!delta.hands.contains_key(&PlayerId(2)));
        assert_eq!(delta.seq, game.seq());
    }

    #[test]
    fn test_illegal_card_leaves_state_unchanged() {
        let mut game = game_with(3, GameSettings::default());
        rig(&mut game, &[vec![(Blue, Number(5)), (Blue, Number(1))], filler(3), filler(4)], (Red, Number(2)));
        let before = game.clone();

        let err = play(&mut game, 1, Blue, Number(5)).unwrap_err();
        assert_eq!(err, ActionError::Validation(ValidationError::IllegalCard));
        assert_eq!(game, before);
    }

    #[test]
    fn test_wrong_turn_rejected() {
        let mut game = game_with(3, GameSettings::default());
        rig(&mut game, &[filler(3), vec![(Red, Number(5)), (Blue, Number(1))], filler(4)], (Red, Number(2)));
        let before = game.clone();
        let err = play(&mut game, 2, Red, Number(5)).unwrap_err();
        assert_eq!(err, ActionError::Validation(ValidationError::NotYourTurn));
        assert_eq!(game, before);
    }

    #[test]
    fn test_reverse_four_players() {
        let mut game = game_with(4, GameSettings::default());
        rig(
            &mut game,
            &[vec![(Red, Reverse), (Blue, Number(1))], filler(3), filler(4), filler(5)],
            (Red, Number(2)),
        );

        play(&mut game, 1, Red, Reverse).unwrap();
        assert_eq!(game.direction(), Direction::CounterClockwise);
        assert_eq!(game.current_index(), 3);
    }

    #[test]
    fn test_two_player_reverse_and_skip_pass_turn() {
        let mut game = game_with(2, GameSettings::default());
        rig(
            &mut game,
            &[vec![(Red, Reverse), (Red, Skip), (Blue, Number(1))], vec![(Red, Number(7)), (Green, Number(1))]],
            (Red, Number(2)),
        );

        play(&mut game, 1, Red, Reverse).unwrap();
        assert_eq!(game.current_player_id(), Some(PlayerId(2)));

        play(&mut game, 2, Red, Number(7)).unwrap();
        play(&mut game, 1, Red, Skip).unwrap();
        assert_eq!(game.current_player_id(), Some(PlayerId(2)));
    }

    #[test]
    fn test_skip_three_players() {
        let mut game = game_with(3, GameSettings::default());
        rig(&mut game, &[vec![(Red, Skip), (Blue, Number(1))], filler(3), filler(4)], (Red, Number(2)));
        play(&mut game, 1, Red, Skip).unwrap();
        assert_eq!(game.current_player_id(), Some(PlayerId(3)));
    }

    #[test]
    fn test_wild_without_color_awaits_choice() {
        let mut game = game_with(3, GameSettings::default());
        rig(&mut game, &[vec![(Wild, CardValue::Wild), (Blue, Number(1))], filler(3), filler(4)], (Red, Number(2)));

        play(&mut game, 1, Wild, CardValue::Wild).unwrap();
        assert_eq!(game.phase(), Phase::AwaitingColorChoice);
        assert_eq!(game.current_player_id(), Some(PlayerId(1)));

        let err = game
            .submit_action(PlayerId(2), Action::ChooseColor { color: Green }, t0())
            .unwrap_err();
        assert_eq!(err, ActionError::Validation(ValidationError::NoColorChoicePending));

        let err = game
            .submit_action(PlayerId(1), Action::ChooseColor { color: Wild }, t0())
            .unwrap_err();
        assert_eq!(err, ActionError::Validation(ValidationError::InvalidColor(Wild)));

        game.submit_action(PlayerId(1), Action::ChooseColor { color: Green }, t0())
            .unwrap();
        assert_eq!(game.current_color(), Green);
        assert_eq!(game.phase(), Phase::Settled);
        assert_eq!(game.current_player_id(), Some(PlayerId(2)));
    }

    #[test]
    fn test_wild_draw_four_with_declared_color() {
        let mut game = game_with(3, GameSettings::default());
        rig(&mut game, &[vec![(Wild, WildDrawFour), (Blue, Number(1))], filler(3), filler(4)], (Red, Number(2)));

        let id = card_id(&game, 1, Wild, WildDrawFour);
        game.submit_action(
            PlayerId(1),
            Action::PlayCard {
                card_id: id,
                declared_color: Some(Blue),
                target_player_id: None,
            },
            t0(),
        )
        .unwrap();
        assert_eq!(game.current_color(), Blue);
        assert_eq!(game.phase(), Phase::AwaitingDrawAck);
        assert_eq!(game.decision_owner(), Some(PlayerId(2)));

        // Target cannot play a normal card.
        let err = play(&mut game, 2, Green, Number(3)).unwrap_err();
        assert_eq!(err, ActionError::Validation(ValidationError::MustResolveDraw));

        game.submit_action(PlayerId(2), Action::DrawCard, t0()).unwrap();
        assert_eq!(game.player(PlayerId(2)).unwrap().hand_size(), 6);
        assert_eq!(game.current_player_id(), Some(PlayerId(3)));
    }

    #[test]
    fn test_stacking_accumulates() {
        let settings = GameSettings {
            stacking_enabled: true,
            ..GameSettings::default()
        };
        let mut game = game_with(3, settings);
        rig(
            &mut game,
            &[
                vec![(Red, DrawTwo), (Blue, Number(1))],
                vec![(Green, DrawTwo), (Blue, Number(2))],
                filler(3),
            ],
            (Red, Number(2)),
        );

        play(&mut game, 1, Red, DrawTwo).unwrap();
        play(&mut game, 2, Green, DrawTwo).unwrap();
        match game.pending() {
            Some(PendingEffect::ForcedDraw { target, amount, .. }) => {
                assert_eq!(*target, PlayerId(3));
                assert_eq!(*amount, 4);
            }
            other => panic!("unexpected pending {:?}", other),
        }
        game.submit_action(PlayerId(3), Action::DrawCard, t0()).unwrap();
        assert_eq!(game.player(PlayerId(3)).unwrap().hand_size(), 6);
        assert_eq!(game.current_player_id(), Some(PlayerId(1)));
    }

    #[test]
    fn test_stacking_disabled_rejects() {
        let mut game = game_with(3, GameSettings::default());
        rig(
            &mut game,
            &[vec![(Red, DrawTwo), (Blue, Number(1))], vec![(Green, DrawTwo), (Blue, Number(2))], filler(3)],
            (Red, Number(2)),
        );
        play(&mut game, 1, Red, DrawTwo).unwrap();
        let err = play(&mut game, 2, Green, DrawTwo).unwrap_err();
        assert_eq!(err, ActionError::Validation(ValidationError::MustResolveDraw));
    }

    #[test]
    fn test_jump_in() {
        let settings = GameSettings {
            jump_in_enabled: true,
            ..GameSettings::default()
        };
        let mut game = game_with(4, settings);
        rig(
            &mut game,
            &[filler(3), filler(4), vec![(Red, Number(2)), (Blue, Number(1))], filler(5)],
            (Red, Number(2)),
        );

        let delta = play(&mut game, 3, Red, Number(2)).unwrap();
        assert!(delta.changes.iter().any(|c| matches!(
            c,
            Change::CardPlayed {
                play: PlayKind::JumpIn,
                ..
            }
        )));
        assert_eq!(game.current_player_id(), Some(PlayerId(4)));
    }

    #[test]
    fn test_jump_in_disabled() {
        let mut game = game_with(4, GameSettings::default());
        rig(
            &mut game,
            &[filler(3), filler(4), vec![(Red, Number(2)), (Blue, Number(1))], filler(5)],
            (Red, Number(2)),
        );
        let err = play(&mut game, 3, Red, Number(2)).unwrap_err();
        assert_eq!(err, ActionError::Validation(ValidationError::NotYourTurn));
    }

    #[test]
    fn test_win_ends_round_with_scores() {
        let mut game = game_with(3, GameSettings::default());
        rig(
            &mut game,
            &[vec![(Red, Number(5))], vec![(Blue, Number(9)), (Green, Skip)], vec![(Wild, CardValue::Wild)]],
            (Red, Number(2)),
        );

        let delta = play(&mut game, 1, Red, Number(5)).unwrap();
        assert_eq!(game.status, GameStatus::RoundOver);
        let (winner, scores) = delta.round_result().unwrap();
        assert_eq!(winner, Some(PlayerId(1)));
        assert_eq!(scores[&PlayerId(1)], 9 + 20 + 50);
        assert_eq!(scores[&PlayerId(2)], 0);
        assert_eq!(scores.len(), 3);
        assert_eq!(game.current_player_id(), None);
    }

    #[test]
    fn test_reaching_target_score_ends_game() {
        let settings = GameSettings {
            target_score: Some(50),
            ..GameSettings::default()
        };
        let mut game = game_with(2, settings);
        rig(
            &mut game,
            &[vec![(Red, Number(5))], vec![(Wild, CardValue::Wild), (Green, Number(1))]],
            (Red, Number(2)),
        );
        play(&mut game, 1, Red, Number(5)).unwrap();
        assert_eq!(game.status, GameStatus::Ended);
    }

    #[test]
    fn test_callout_within_window() {
        let settings = GameSettings {
            challenge_rule: true,
            ..GameSettings::default()
        };
        let mut game = game_with(3, settings);
        rig(
            &mut game,
            &[vec![(Red, Number(5)), (Blue, Number(1))], filler(3), filler(4)],
            (Red, Number(2)),
        );

        play(&mut game, 1, Red, Number(5)).unwrap();
        assert_eq!(game.phase(), Phase::AwaitingCalloutWindow);
        assert!(rules::must_call_uno(&game, PlayerId(1)));

        let delta = game
            .submit_action(
                PlayerId(3),
                Action::CallOut {
                    target_player_id: PlayerId(1),
                },
                t0(),
            )
            .unwrap();
        assert_eq!(game.player(PlayerId(1)).unwrap().hand_size(), 3);
        assert!(delta.changes.iter().any(|c| matches!(c, Change::CalledOut { penalty: 2, .. })));
        assert_eq!(game.current_player_id(), Some(PlayerId(2)));
    }

    #[test]
    fn test_callout_after_window_closes() {
        let settings = GameSettings {
            challenge_rule: true,
            ..GameSettings::default()
        };
        let mut game = game_with(3, settings);
        rig(
            &mut game,
            &[vec![(Red, Number(5)), (Blue, Number(1))], vec![(Red, Number(6)), (Green, Number(9))], filler(3)],
            (Red, Number(2)),
        );

        play(&mut game, 1, Red, Number(5)).unwrap();
        play(&mut game, 2, Red, Number(6)).unwrap();
        assert!(game.callout().is_none());

        let err = game
            .submit_action(
                PlayerId(3),
                Action::CallOut {
                    target_player_id: PlayerId(1),
                },
                t0(),
            )
            .unwrap_err();
        assert_eq!(err, ActionError::Validation(ValidationError::NothingToCallOut));
        assert_eq!(game.player(PlayerId(1)).unwrap().hand_size(), 1);
    }

    #[test]
    fn test_callout_after_deadline_before_timeout_resolves() {
        let settings = GameSettings {
            challenge_rule: true,
            ..GameSettings::default()
        };
        let mut game = game_with(3, settings);
        rig(
            &mut game,
            &[vec![(Red, Number(5)), (Blue, Number(1))], filler(3), filler(4)],
            (Red, Number(2)),
        );

        play(&mut game, 1, Red, Number(5)).unwrap();
        let deadline = game.callout().unwrap().deadline;
        let seq = game.seq();

        for late in [deadline, deadline + Duration::seconds(1)] {
            let err = game
                .submit_action(
                    PlayerId(3),
                    Action::CallOut {
                        target_player_id: PlayerId(1),
                    },
                    late,
                )
                .unwrap_err();
            assert_eq!(err, ActionError::Validation(ValidationError::NothingToCallOut));
        }
        assert_eq!(game.player(PlayerId(1)).unwrap().hand_size(), 1);
        assert_eq!(game.seq(), seq);

        // Just inside the window the callout still lands.
        game.submit_action(
            PlayerId(3),
            Action::CallOut {
                target_player_id: PlayerId(1),
            },
            deadline - Duration::seconds(1),
        )
        .unwrap();
        assert_eq!(game.player(PlayerId(1)).unwrap().hand_size(), 3);
    }

    #[test]
    fn test_call_uno_prevents_callout() {
        let settings = GameSettings {
            challenge_rule: true,
            ..GameSettings::default()
        };
        let mut game = game_with(3, settings);
        rig(
            &mut game,
            &[vec![(Red, Number(5)), (Blue, Number(1))], filler(3), filler(4)],
            (Red, Number(2)),
        );

        game.submit_action(PlayerId(1), Action::CallUno, t0()).unwrap();
        play(&mut game, 1, Red, Number(5)).unwrap();
        assert!(game.callout().is_none());
        assert!(!rules::must_call_uno(&game, PlayerId(1)));
    }

    #[test]
    fn test_callout_disabled() {
        let mut game = game_with(3, GameSettings::default());
        rig(
            &mut game,
            &[vec![(Red, Number(5)), (Blue, Number(1))], filler(3), filler(4)],
            (Red, Number(2)),
        );
        play(&mut game, 1, Red, Number(5)).unwrap();
        let err = game
            .submit_action(
                PlayerId(2),
                Action::CallOut {
                    target_player_id: PlayerId(1),
                },
                t0(),
            )
            .unwrap_err();
        assert_eq!(err, ActionError::Validation(ValidationError::CalloutDisabled));
    }

    #[test]
    fn test_seven_swaps_hands() {
        let settings = GameSettings {
            seven_o_rule: true,
            ..GameSettings::default()
        };
        let mut game = game_with(3, settings);
        rig(
            &mut game,
            &[vec![(Red, Number(7)), (Blue, Number(1))], filler(3), vec![(Yellow, Number(9))]],
            (Red, Number(2)),
        );

        let err = play(&mut game, 1, Red, Number(7)).unwrap_err();
        assert_eq!(err, ActionError::Validation(ValidationError::TargetRequired));

        let id = card_id(&game, 1, Red, Number(7));
        game.submit_action(
            PlayerId(1),
            Action::PlayCard {
                card_id: id,
                declared_color: None,
                target_player_id: Some(PlayerId(3)),
            },
            t0(),
        )
        .unwrap();
        assert_eq!(game.player(PlayerId(1)).unwrap().hand()[0].value(), Number(9));
        assert_eq!(game.player(PlayerId(3)).unwrap().hand()[0].value(), Number(1));
    }

    #[test]
    fn test_zero_rotates_hands() {
        let settings = GameSettings {
            seven_o_rule: true,
            ..GameSettings::default()
        };
        let mut game = game_with(3, settings);
        rig(
            &mut game,
            &[
                vec![(Red, Number(0)), (Blue, Number(1))],
                vec![(Green, Number(4))],
                vec![(Yellow, Number(9)), (Yellow, Number(8))],
            ],
            (Red, Number(2)),
        );

        play(&mut game, 1, Red, Number(0)).unwrap();
        // Clockwise: seat 0 -> seat 1 -> seat 2 -> seat 0.
        assert_eq!(game.player(PlayerId(2)).unwrap().hand()[0].value(), Number(1));
        assert_eq!(game.player(PlayerId(3)).unwrap().hand()[0].value(), Number(4));
        assert_eq!(game.player(PlayerId(1)).unwrap().hand_size(), 2);
    }

    #[test]
    fn test_draw_then_pass() {
        let mut game = game_with(3, GameSettings::default());
        rig(&mut game, &[vec![(Blue, Number(5)), (Blue, Number(1))], filler(3), filler(4)], (Red, Number(2)));
        let before = game.player(PlayerId(1)).unwrap().hand_size();

        game.submit_action(PlayerId(1), Action::DrawCard, t0()).unwrap();
        assert_eq!(game.player(PlayerId(1)).unwrap().hand_size(), before + 1);

        if game.drawn_card().is_some() {
            let err = game
                .submit_action(PlayerId(1), Action::DrawCard, t0())
                .unwrap_err();
            assert_eq!(err, ActionError::Validation(ValidationError::MustPlayDrawnCard));
            game.submit_action(PlayerId(1), Action::PassTurn, t0()).unwrap();
        }
        assert_eq!(game.current_player_id(), Some(PlayerId(2)));
    }

    #[test]
    fn test_draw_until_match_keeps_drawing() {
        let settings = GameSettings {
            draw_until_match: true,
            ..GameSettings::default()
        };
        let mut game = game_with(3, settings);
        rig_with_draws(
            &mut game,
            &[vec![(Blue, Number(5)), (Blue, Number(1))], filler(3), filler(4)],
            (Red, Number(2)),
            &[(Green, Number(7)), (Yellow, Number(8)), (Red, Number(9))],
        );

        let delta = game.submit_action(PlayerId(1), Action::DrawCard, t0()).unwrap();
        assert!(delta.changes.iter().any(|c| matches!(c, Change::CardsDrawn { count: 3, .. })));
        assert_eq!(game.player(PlayerId(1)).unwrap().hand_size(), 5);
        assert_eq!(game.current_player_id(), Some(PlayerId(1)));
        assert_eq!(game.drawn_card(), Some(card_id(&game, 1, Red, Number(9))));

        play(&mut game, 1, Red, Number(9)).unwrap();
        assert_eq!(game.current_player_id(), Some(PlayerId(2)));
    }

    #[test]
    fn test_single_draw_without_draw_until_match() {
        let mut game = game_with(3, GameSettings::default());
        rig_with_draws(
            &mut game,
            &[vec![(Blue, Number(5)), (Blue, Number(1))], filler(3), filler(4)],
            (Red, Number(2)),
            &[(Green, Number(7)), (Red, Number(9))],
        );

        game.submit_action(PlayerId(1), Action::DrawCard, t0()).unwrap();
        assert_eq!(game.player(PlayerId(1)).unwrap().hand_size(), 3);
        assert_eq!(game.drawn_card(), None);
        assert_eq!(game.current_player_id(), Some(PlayerId(2)));
    }

    #[test]
    fn test_force_play_plays_drawn_card() {
        let settings = GameSettings {
            force_play: true,
            ..GameSettings::default()
        };
        let mut game = game_with(3, settings);
        rig_with_draws(
            &mut game,
            &[vec![(Blue, Number(5)), (Blue, Number(1))], filler(3), filler(4)],
            (Red, Number(2)),
            &[(Red, Number(9))],
        );

        let delta = game.submit_action(PlayerId(1), Action::DrawCard, t0()).unwrap();
        assert!(delta.changes.iter().any(|c| matches!(
            c,
            Change::CardPlayed {
                play: PlayKind::Turn,
                ..
            }
        )));
        assert_eq!(game.player(PlayerId(1)).unwrap().hand_size(), 2);
        assert_eq!(game.top_card().map(|c| c.value()), Some(Number(9)));
        assert_eq!(game.drawn_card(), None);
        assert_eq!(game.current_player_id(), Some(PlayerId(2)));
    }

    #[test]
    fn test_force_play_keeps_unplayable_draw() {
        let settings = GameSettings {
            force_play: true,
            ..GameSettings::default()
        };
        let mut game = game_with(3, settings);
        rig_with_draws(
            &mut game,
            &[vec![(Blue, Number(5)), (Blue, Number(1))], filler(3), filler(4)],
            (Red, Number(2)),
            &[(Green, Number(7))],
        );

        game.submit_action(PlayerId(1), Action::DrawCard, t0()).unwrap();
        assert_eq!(game.player(PlayerId(1)).unwrap().hand_size(), 3);
        assert_eq!(game.top_card().map(|c| c.value()), Some(Number(2)));
        assert_eq!(game.current_player_id(), Some(PlayerId(2)));
    }

    #[test]
    fn test_swap_hands_needs_target_with_three_players() {
        let settings = GameSettings {
            special_swap_hands: true,
            ..GameSettings::default()
        };
        let mut game = game_with(3, settings);
        rig(
            &mut game,
            &[vec![(Wild, SwapHands), (Blue, Number(1))], filler(3), vec![(Yellow, Number(9))]],
            (Red, Number(2)),
        );

        let err = play(&mut game, 1, Wild, SwapHands).unwrap_err();
        assert_eq!(err, ActionError::Validation(ValidationError::TargetRequired));

        let id = card_id(&game, 1, Wild, SwapHands);
        let delta = game
            .submit_action(
                PlayerId(1),
                Action::PlayCard {
                    card_id: id,
                    declared_color: None,
                    target_player_id: Some(PlayerId(3)),
                },
                t0(),
            )
            .unwrap();
        assert!(delta.changes.iter().any(|c| matches!(
            c,
            Change::HandsSwapped {
                first: PlayerId(1),
                second: PlayerId(3)
            }
        )));
        assert_eq!(game.player(PlayerId(1)).unwrap().hand()[0].value(), Number(9));
        assert_eq!(game.player(PlayerId(3)).unwrap().hand()[0].value(), Number(1));
        // The swap keeps the active color.
        assert_eq!(game.current_color(), Red);
        assert_eq!(game.current_player_id(), Some(PlayerId(2)));
        game.check_invariants().unwrap();
    }

    #[test]
    fn test_swap_hands_picks_only_opponent() {
        let settings = GameSettings {
            special_swap_hands: true,
            ..GameSettings::default()
        };
        let mut game = game_with(2, settings);
        rig(
            &mut game,
            &[vec![(Wild, SwapHands), (Blue, Number(1))], filler(3)],
            (Red, Number(2)),
        );

        play(&mut game, 1, Wild, SwapHands).unwrap();
        assert_eq!(game.player(PlayerId(1)).unwrap().hand_size(), 2);
        assert_eq!(game.player(PlayerId(2)).unwrap().hand()[0].value(), Number(1));
        assert_eq!(game.current_player_id(), Some(PlayerId(2)));
    }

    #[test]
    fn test_blank_matches_color_or_blank() {
        let settings = GameSettings {
            blank_cards: true,
            ..GameSettings::default()
        };
        let mut game = game_with(3, settings);
        rig(
            &mut game,
            &[
                vec![(Red, Blank), (Blue, Number(1))],
                vec![(Green, Blank), (Green, Number(3))],
                vec![(Blue, Blank), (Yellow, Number(4))],
            ],
            (Red, Number(2)),
        );

        let err = play(&mut game, 3, Blue, Blank).unwrap_err();
        assert_eq!(err, ActionError::Validation(ValidationError::NotYourTurn));

        play(&mut game, 1, Red, Blank).unwrap();
        assert_eq!(game.current_player_id(), Some(PlayerId(2)));

        // Blank on blank is a value match.
        play(&mut game, 2, Green, Blank).unwrap();
        assert_eq!(game.current_color(), Green);
        assert_eq!(game.current_player_id(), Some(PlayerId(3)));
        assert_eq!(game.direction(), Direction::Clockwise);
    }

    #[test]
    fn test_pass_without_draw_rejected() {
        let mut game = game_with(3, GameSettings::default());
        let err = game
            .submit_action(PlayerId(1), Action::PassTurn, t0())
            .unwrap_err();
        assert_eq!(err, ActionError::Validation(ValidationError::CannotPass));
    }

    #[test]
    fn test_color_choice_timeout_picks_least_held() {
        let mut game = game_with(3, GameSettings::default());
        rig(
            &mut game,
            &[
                vec![(Wild, CardValue::Wild), (Red, Number(1)), (Blue, Number(1)), (Green, Number(1))],
                filler(3),
                filler(4),
            ],
            (Red, Number(2)),
        );
        play(&mut game, 1, Wild, CardValue::Wild).unwrap();

        assert!(game.force_advance(t0()).unwrap().is_none());
        let later = t0() + game.settings.game_speed.decision_timeout();
        let delta = game.force_advance(later).unwrap().unwrap();
        assert_eq!(game.current_color(), Yellow);
        assert!(delta.changes.iter().any(|c| matches!(
            c,
            Change::TimedOut {
                decision: TimeoutKind::ColorChoice,
                ..
            }
        )));
        assert_eq!(game.current_player_id(), Some(PlayerId(2)));
    }

    #[test]
    fn test_turn_timeout_draws_and_passes() {
        let mut game = game_with(3, GameSettings::default());
        let before = game.player(PlayerId(1)).unwrap().hand_size();
        let later = t0() + game.settings.game_speed.turn_timeout();
        game.force_advance(later).unwrap().unwrap();
        assert_eq!(game.player(PlayerId(1)).unwrap().hand_size(), before + 1);
        assert_eq!(game.current_player_id(), Some(PlayerId(2)));
    }

    #[test]
    fn test_stale_sequence_conflict() {
        let mut game = game_with(3, GameSettings::default());
        rig(&mut game, &[vec![(Red, Number(5)), (Blue, Number(1))], filler(3), filler(4)], (Red, Number(2)));
        let stale = game.seq();
        play(&mut game, 1, Red, Number(5)).unwrap();

        let err = game
            .submit_action_at(PlayerId(2), Action::DrawCard, Some(stale), t0())
            .unwrap_err();
        assert!(err.requires_resync());

        let current = game.seq();
        game.submit_action_at(PlayerId(2), Action::DrawCard, Some(current), t0())
            .unwrap();
    }

    #[test]
    fn test_leave_mid_round_passes_turn() {
        let mut game = game_with(3, GameSettings::default());
        let deck_size = game.deck_size();
        game.remove_player(PlayerId(1), t0()).unwrap();
        assert_eq!(game.player_count(), 2);
        assert_eq!(game.current_player_id(), Some(PlayerId(2)));
        assert_eq!(game.card_count(), deck_size);
        assert_eq!(game.host_id(), Some(PlayerId(2)));
    }

    #[test]
    fn test_leave_leaving_one_player_ends_round() {
        let mut game = game_with(2, GameSettings::default());
        let delta = game.remove_player(PlayerId(2), t0()).unwrap();
        assert_eq!(game.status, GameStatus::RoundOver);
        assert_eq!(delta.round_result().unwrap().0, Some(PlayerId(1)));
    }

    #[test]
    fn test_set_connected_is_idempotent() {
        let mut game = game_with(2, GameSettings::default());
        assert!(game.set_connected(PlayerId(1), true).unwrap().is_none());
        assert!(game.set_connected(PlayerId(1), false).unwrap().is_some());
        assert!(game.set_connected(PlayerId(1), false).unwrap().is_none());
    }

    #[test]
    fn test_view_hides_other_hands() {
        let game = game_with(3, GameSettings::default());
        let view = game.view_for(PlayerId(2));
        assert_eq!(view.your_hand.len(), 7);
        assert_eq!(view.players.len(), 3);
        assert!(view.players[0].is_current_turn);
        assert_eq!(view.players[1].hand_size, 7);
    }

    #[test]
    fn test_serde_roundtrip_preserves_state() {
        let game = game_with(3, GameSettings::default());
        let json = serde_json::to_string(&game).unwrap();
        let restored: GameState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, game);
    }
}
