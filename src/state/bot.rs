//! Built-in bot policy.
//!
//! Bots play the first legal card, keeping wilds for last, declare the
//! color they hold most of and draw when nothing fits. They call Uno
//! before playing down to one card.

use super::card::Card;
use super::game::{Action, GameState, PendingEffect};
use super::player::PlayerId;
use super::rules;

/// Actions the bot wants to submit, in order. Empty when the bot has
/// nothing to decide right now.
pub fn plan(state: &GameState, bot: PlayerId) -> Vec<Action> {
    if !state.status.is_active() || state.decision_owner() != Some(bot) {
        return Vec::new();
    }
    let Some(player) = state.player(bot) else {
        return Vec::new();
    };

    if let Some(PendingEffect::ColorChoice { .. }) = state.pending() {
        return vec![Action::ChooseColor {
            color: rules::most_held_color(player),
        }];
    }

    let playable = rules::playable_cards(state, bot);
    let Some(card) = pick(&playable) else {
        return match (state.pending(), state.drawn_card()) {
            (None, Some(_)) => vec![Action::PassTurn],
            _ => vec![Action::DrawCard],
        };
    };

    let declared_color = card
        .needs_color()
        .then(|| rules::most_held_color(player));
    let target_player_id = if rules::needs_target(state, &card) {
        rules::default_swap_target(state, bot)
    } else {
        None
    };

    let mut actions = Vec::with_capacity(2);
    if player.hand_size() == 2 && !player.uno_declared {
        actions.push(Action::CallUno);
    }
    actions.push(Action::PlayCard {
        card_id: card.id(),
        declared_color,
        target_player_id,
    });
    actions
}

fn pick(playable: &[Card]) -> Option<Card> {
    playable
        .iter()
        .find(|c| !c.is_wild())
        .or_else(|| playable.first())
        .copied()
}
