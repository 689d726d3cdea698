//! Seated players and their hands.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::card::{Card, CardId, Color};

/// Stable player identity, assigned by the room manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub u64);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// A player seated in a game.
///
/// The hand is private to the owning game: only `GameState` methods move
/// cards in or out of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    hand: Vec<Card>,
    pub is_bot: bool,
    pub is_host: bool,
    pub is_connected: bool,
    /// Set by `CallUno`, cleared whenever the hand grows past one card.
    pub uno_declared: bool,
}

impl Player {
    pub fn new(id: PlayerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            hand: Vec::new(),
            is_bot: false,
            is_host: false,
            is_connected: true,
            uno_declared: false,
        }
    }

    pub fn bot(id: PlayerId, name: impl Into<String>) -> Self {
        Self {
            is_bot: true,
            ..Self::new(id, name)
        }
    }

    pub fn with_host(mut self, is_host: bool) -> Self {
        self.is_host = is_host;
        self
    }

    pub fn hand(&self) -> &[Card] {
        &self.hand
    }

    pub fn hand_size(&self) -> usize {
        self.hand.len()
    }

    pub fn has_won(&self) -> bool {
        self.hand.is_empty()
    }

    pub fn find_card(&self, card_id: CardId) -> Option<&Card> {
        self.hand.iter().find(|c| c.id() == card_id)
    }

    pub(crate) fn take_card(&mut self, card_id: CardId) -> Option<Card> {
        let index = self.hand.iter().position(|c| c.id() == card_id)?;
        let card = self.hand.remove(index);
        if self.hand.len() != 1 {
            self.uno_declared = false;
        }
        Some(card)
    }

    pub(crate) fn give_cards(&mut self, cards: impl IntoIterator<Item = Card>) {
        self.hand.extend(cards);
        if self.hand.len() > 1 {
            self.uno_declared = false;
        }
    }

    pub(crate) fn take_hand(&mut self) -> Vec<Card> {
        self.uno_declared = false;
        std::mem::take(&mut self.hand)
    }

    pub(crate) fn replace_hand(&mut self, hand: Vec<Card>) {
        self.hand = hand;
        self.uno_declared = false;
    }

    /// Number of cards of a given color in hand.
    pub fn count_color(&self, color: Color) -> usize {
        self.hand.iter().filter(|c| c.color() == color).count()
    }

    /// Total point value of the hand.
    pub fn hand_points(&self) -> u32 {
        self.hand.iter().map(|c| c.value().points()).sum()
    }

    /// Public view without the cards themselves.
    pub fn public_view(&self) -> PublicPlayer {
        PublicPlayer {
            id: self.id,
            name: self.name.clone(),
            hand_size: self.hand.len(),
            is_bot: self.is_bot,
            is_host: self.is_host,
            is_connected: self.is_connected,
            uno_declared: self.uno_declared,
            is_current_turn: false,
        }
    }
}

/// What other clients may know about a player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicPlayer {
    pub id: PlayerId,
    pub name: String,
    pub hand_size: usize,
    pub is_bot: bool,
    pub is_host: bool,
    pub is_connected: bool,
    pub uno_declared: bool,
    pub is_current_turn: bool,
}
