//! Rule decisions.
//!
//! Everything here is a pure function of a [`GameState`] snapshot: nothing
//! mutates state and nothing reads the clock. [`GameState`] applies the
//! decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::card::{Card, CardId, CardValue, Color};
use super::game::{Direction, GameState, PendingEffect};
use super::player::{Player, PlayerId};
use crate::error::ValidationError;

/// How a legal play relates to the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayKind {
    /// Ordinary play by the current player.
    Turn,
    /// Draw card played onto a pending forced draw.
    Stack,
    /// Identical card played out of turn.
    JumpIn,
}

/// What the active color becomes after a play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorOutcome {
    Keep,
    Set(Color),
    Choose,
}

/// Hand movements triggered by a play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandEffect {
    Swap { with: PlayerId },
    Rotate,
}

/// Effects of a play, decided before anything is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub actor: PlayerId,
    pub card: Card,
    pub kind: PlayKind,
    pub color: ColorOutcome,
    pub reverses: bool,
    pub skip: usize,
    /// Total forced draw for the next player, including stacked amounts.
    pub draw_penalty: u32,
    pub hand_effect: Option<HandEffect>,
}

/// Seat reached by moving `steps` seats from `from`.
pub fn step(from: usize, direction: Direction, steps: usize, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    let n = count as isize;
    let offset = direction.sign() * steps as isize;
    (from as isize + offset).rem_euclid(n) as usize
}

/// Seat that gets the turn after `actor` resolves a play with `skip`
/// skipped seats. Never hands the turn straight back to the actor.
pub fn next_turn_index(actor: usize, direction: Direction, skip: usize, count: usize) -> usize {
    let next = step(actor, direction, 1 + skip, count);
    if next == actor && count > 1 {
        step(actor, direction, 1, count)
    } else {
        next
    }
}

/// Whether `card` matches the discard pile ignoring turn ownership.
pub fn matches_top(state: &GameState, card: &Card) -> bool {
    if card.is_wild() {
        return true;
    }
    if card.color() == state.current_color() {
        return true;
    }
    state
        .top_card()
        .map(|top| !top.is_wild() && top.value() == card.value())
        .unwrap_or(false)
}

/// Whether `card` can be stacked onto a pending draw started by `last`.
pub fn can_stack(card: &Card, last: CardValue) -> bool {
    match card.value() {
        CardValue::WildDrawFour => true,
        CardValue::DrawTwo => last == CardValue::DrawTwo,
        _ => false,
    }
}

/// Validate a play and classify it.
pub fn check_play(
    state: &GameState,
    player_id: PlayerId,
    card_id: CardId,
) -> Result<(Card, PlayKind), ValidationError> {
    if !state.status.is_active() {
        return Err(ValidationError::GameNotInProgress);
    }
    let player = state.player(player_id).ok_or(ValidationError::UnknownPlayer)?;
    let card = *player
        .find_card(card_id)
        .ok_or(ValidationError::CardNotInHand)?;

    match state.pending() {
        Some(PendingEffect::ColorChoice { .. }) => {
            return Err(ValidationError::AwaitingColorChoice);
        }
        Some(PendingEffect::ForcedDraw { target, last, .. }) => {
            if *target != player_id {
                return Err(ValidationError::NotYourTurn);
            }
            if state.settings.stacking_enabled && can_stack(&card, *last) {
                return Ok((card, PlayKind::Stack));
            }
            return Err(ValidationError::MustResolveDraw);
        }
        None => {}
    }

    if state.current_player_id() == Some(player_id) {
        if let Some(drawn) = state.drawn_card() {
            if drawn != card_id {
                return Err(ValidationError::MustPlayDrawnCard);
            }
        }
        if matches_top(state, &card) {
            return Ok((card, PlayKind::Turn));
        }
        return Err(ValidationError::IllegalCard);
    }

    let identical = state
        .top_card()
        .map(|top| card.is_identical_to(top))
        .unwrap_or(false);
    if state.settings.jump_in_enabled && identical {
        Ok((card, PlayKind::JumpIn))
    } else {
        Err(ValidationError::NotYourTurn)
    }
}

/// Legal iff it is the player's turn (or a jump-in/stacking exception
/// applies) and the card matches.
pub fn is_legal_play(state: &GameState, player_id: PlayerId, card: &Card) -> bool {
    check_play(state, player_id, card.id()).is_ok()
}

/// Whether the play needs a swap target.
pub fn needs_target(state: &GameState, card: &Card) -> bool {
    match card.value() {
        CardValue::SwapHands => true,
        CardValue::Number(7) => state.settings.seven_o_rule,
        _ => false,
    }
}

/// Validate or infer the swap target for a play.
pub fn resolve_target(
    state: &GameState,
    actor: PlayerId,
    card: &Card,
    target: Option<PlayerId>,
) -> Result<Option<PlayerId>, ValidationError> {
    let last_card = state
        .player(actor)
        .map(|p| p.hand_size() == 1)
        .unwrap_or(false);
    if !needs_target(state, card) || last_card {
        return Ok(None);
    }

    match target {
        Some(t) if t != actor && state.player(t).is_some() => Ok(Some(t)),
        Some(_) => Err(ValidationError::InvalidTarget),
        None => {
            let mut others = state.players().iter().filter(|p| p.id != actor);
            match (others.next(), others.next()) {
                (Some(only), None) => Ok(Some(only.id)),
                _ => Err(ValidationError::TargetRequired),
            }
        }
    }
}

/// Decide the effects of a validated play.
pub fn resolve_play(
    state: &GameState,
    actor: PlayerId,
    card: Card,
    kind: PlayKind,
    declared_color: Option<Color>,
    target: Option<PlayerId>,
) -> Result<Resolution, ValidationError> {
    if let Some(color) = declared_color {
        if color.is_wild() {
            return Err(ValidationError::InvalidColor(color));
        }
    }

    let value = card.value();
    let carried = match (kind, state.pending()) {
        (PlayKind::Stack, Some(PendingEffect::ForcedDraw { amount, .. })) => *amount,
        _ => 0,
    };
    let draw_penalty = match value.draw_penalty() {
        0 => 0,
        n => n + carried,
    };

    let color = if card.needs_color() {
        declared_color.map_or(ColorOutcome::Choose, ColorOutcome::Set)
    } else if card.is_wild() {
        ColorOutcome::Keep
    } else {
        ColorOutcome::Set(card.color())
    };

    let reverses = value == CardValue::Reverse;
    let two_players = state.players().len() == 2;
    let skip = usize::from(value == CardValue::Skip || (reverses && two_players));

    let hand_effect = match value {
        CardValue::Number(0) if state.settings.seven_o_rule => Some(HandEffect::Rotate),
        _ => target.map(|with| HandEffect::Swap { with }),
    };

    Ok(Resolution {
        actor,
        card,
        kind,
        color,
        reverses,
        skip,
        draw_penalty,
        hand_effect,
    })
}

/// True once the player has emptied their hand.
pub fn check_win(state: &GameState, player_id: PlayerId) -> bool {
    state.player(player_id).map(Player::has_won).unwrap_or(false)
}

/// True when the player sits on one card without having called Uno.
pub fn must_call_uno(state: &GameState, player_id: PlayerId) -> bool {
    state
        .player(player_id)
        .map(|p| p.hand_size() == 1 && !p.uno_declared)
        .unwrap_or(false)
}

/// Validate a callout made at `now`. The window is closed from its
/// deadline on, even if no timeout has resolved it yet.
pub fn check_callout(
    state: &GameState,
    caller: PlayerId,
    target: PlayerId,
    now: DateTime<Utc>,
) -> Result<(), ValidationError> {
    if !state.status.is_active() {
        return Err(ValidationError::GameNotInProgress);
    }
    if !state.settings.challenge_rule {
        return Err(ValidationError::CalloutDisabled);
    }
    if state.player(caller).is_none() {
        return Err(ValidationError::UnknownPlayer);
    }
    let open = state
        .callout()
        .map(|w| w.target == target && now < w.deadline)
        .unwrap_or(false);
    if caller == target || !open || !must_call_uno(state, target) {
        return Err(ValidationError::NothingToCallOut);
    }
    Ok(())
}

/// Cards the player could legally play right now.
pub fn playable_cards(state: &GameState, player_id: PlayerId) -> Vec<Card> {
    state
        .player(player_id)
        .map(|p| {
            p.hand()
                .iter()
                .filter(|c| check_play(state, player_id, c.id()).is_ok())
                .copied()
                .collect()
        })
        .unwrap_or_default()
}

/// Color the player holds the fewest of. Ties go to the earlier color in
/// red, blue, green, yellow order.
pub fn least_held_color(player: Option<&Player>) -> Color {
    Color::PLAYABLE
        .into_iter()
        .min_by_key(|c| player.map(|p| p.count_color(*c)).unwrap_or(0))
        .unwrap_or(Color::Red)
}

/// Color the player holds the most of. Ties go to the earlier color.
pub fn most_held_color(player: &Player) -> Color {
    Color::PLAYABLE
        .into_iter()
        .rev()
        .max_by_key(|c| player.count_color(*c))
        .unwrap_or(Color::Red)
}

/// Swap partner chosen on a player's behalf: whoever holds the fewest cards.
pub fn default_swap_target(state: &GameState, actor: PlayerId) -> Option<PlayerId> {
    state
        .players()
        .iter()
        .filter(|p| p.id != actor)
        .min_by_key(|p| p.hand_size())
        .map(|p| p.id)
}
