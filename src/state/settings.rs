//! House-rule toggles chosen by the host.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::card::DeckComposition;

/// Cards held back from the deal for the flip and a few draws.
const DRAW_RESERVE: usize = 10;

/// Most seats the smallest deck can deal one card each to.
pub fn max_seats() -> usize {
    DeckComposition::default().size() - DRAW_RESERVE
}

/// Pace of a game. Controls how long pending decisions may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameSpeed {
    Slow,
    #[default]
    Normal,
    Fast,
}

impl GameSpeed {
    /// Timeout for color choice, forced draw and callout window.
    pub fn decision_timeout(&self) -> Duration {
        match self {
            Self::Slow => Duration::seconds(30),
            Self::Normal => Duration::seconds(15),
            Self::Fast => Duration::seconds(8),
        }
    }

    /// Timeout for an idle turn.
    pub fn turn_timeout(&self) -> Duration {
        self.decision_timeout() * 2
    }
}

/// Rule toggles for a game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GameSettings {
    pub stacking_enabled: bool,
    pub jump_in_enabled: bool,
    pub draw_until_match: bool,
    pub force_play: bool,
    pub seven_o_rule: bool,
    pub blank_cards: bool,
    pub challenge_rule: bool,
    pub play_drawn_card: bool,
    pub special_swap_hands: bool,
    pub game_speed: GameSpeed,
    pub hand_size: usize,
    pub uno_penalty: usize,
    pub target_score: Option<u32>,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            stacking_enabled: false,
            jump_in_enabled: false,
            draw_until_match: false,
            force_play: false,
            seven_o_rule: false,
            blank_cards: false,
            challenge_rule: false,
            play_drawn_card: true,
            special_swap_hands: false,
            game_speed: GameSpeed::Normal,
            hand_size: 7,
            uno_penalty: 2,
            target_score: Some(500),
        }
    }
}

impl GameSettings {
    pub fn composition(&self) -> DeckComposition {
        DeckComposition {
            blank_cards: self.blank_cards,
            swap_hands: self.special_swap_hands,
        }
    }

    /// Clamp values that would make a round impossible to deal.
    pub fn normalized(mut self, max_players: usize) -> Self {
        let deck = self.composition().size();
        let max_hand = (deck.saturating_sub(DRAW_RESERVE)) / max_players.max(1);
        self.hand_size = self.hand_size.clamp(1, max_hand.max(1));
        self
    }
}
