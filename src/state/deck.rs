//! Draw and discard piles.

use serde::{Deserialize, Serialize};

use super::card::Card;
use super::rng::GameRng;
use crate::error::InternalConsistencyError;

/// Owns the draw pile and discard pile of one round.
///
/// The last element of each vector is the top of that pile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deck {
    draw_pile: Vec<Card>,
    discard_pile: Vec<Card>,
    reshuffles: u32,
}

impl Deck {
    /// Shuffle a full set of cards into a fresh draw pile.
    pub fn new(mut cards: Vec<Card>, rng: &mut GameRng) -> Self {
        rng.shuffle(&mut cards);
        Self {
            draw_pile: cards,
            discard_pile: Vec::new(),
            reshuffles: 0,
        }
    }

    /// A deck holding no cards, used before the first deal.
    pub fn empty() -> Self {
        Self {
            draw_pile: Vec::new(),
            discard_pile: Vec::new(),
            reshuffles: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_piles(draw_pile: Vec<Card>, discard_pile: Vec<Card>) -> Self {
        Self {
            draw_pile,
            discard_pile,
            reshuffles: 0,
        }
    }

    /// Return a uniformly shuffled copy of `cards`.
    pub fn shuffle(mut cards: Vec<Card>, rng: &mut GameRng) -> Vec<Card> {
        rng.shuffle(&mut cards);
        cards
    }

    /// Draw `n` cards, reshuffling the discard pile when the draw pile runs
    /// out. Fails only when both piles are exhausted.
    pub fn draw(&mut self, n: usize, rng: &mut GameRng) -> Result<Vec<Card>, InternalConsistencyError> {
        let mut drawn = Vec::with_capacity(n);
        for _ in 0..n {
            drawn.push(self.draw_one(rng)?);
        }
        Ok(drawn)
    }

    /// Draw up to `n` cards, stopping quietly when only the discard top
    /// is left. Cards held in hands are never recalled.
    pub fn draw_up_to(&mut self, n: usize, rng: &mut GameRng) -> Vec<Card> {
        let mut drawn = Vec::with_capacity(n);
        while drawn.len() < n && self.can_draw() {
            match self.draw_one(rng) {
                Ok(card) => drawn.push(card),
                Err(_) => break,
            }
        }
        drawn
    }

    /// Draw a single card.
    pub fn draw_one(&mut self, rng: &mut GameRng) -> Result<Card, InternalConsistencyError> {
        if self.draw_pile.is_empty() {
            self.reshuffle_from_discard(rng);
        }
        self.draw_pile
            .pop()
            .ok_or(InternalConsistencyError::DeckExhausted)
    }

    /// Put a card on top of the discard pile.
    pub fn discard(&mut self, card: Card) {
        self.discard_pile.push(card);
    }

    /// Put cards underneath the discard top (cards leaving the round with a
    /// departing player).
    pub fn bury(&mut self, cards: Vec<Card>) {
        let top = self.discard_pile.pop();
        self.discard_pile.extend(cards);
        if let Some(top) = top {
            self.discard_pile.push(top);
        }
    }

    /// Put a card back into the draw pile at a random position.
    pub fn return_to_draw_pile(&mut self, card: Card, rng: &mut GameRng) {
        let position = rng.gen_index(self.draw_pile.len() + 1);
        self.draw_pile.insert(position, card);
    }

    /// Move every discard except the top into a freshly shuffled draw pile.
    pub fn reshuffle_from_discard(&mut self, rng: &mut GameRng) {
        let Some(top) = self.discard_pile.pop() else {
            return;
        };
        if self.discard_pile.is_empty() {
            self.discard_pile.push(top);
            return;
        }

        let mut recycled = std::mem::take(&mut self.discard_pile);
        rng.shuffle(&mut recycled);
        recycled.append(&mut self.draw_pile);
        self.draw_pile = recycled;
        self.discard_pile.push(top);
        self.reshuffles += 1;
        tracing::debug!(cards = self.draw_pile.len(), "reshuffled discard pile");
    }

    pub fn top(&self) -> Option<&Card> {
        self.discard_pile.last()
    }

    pub fn draw_pile_len(&self) -> usize {
        self.draw_pile.len()
    }

    pub fn discard_pile_len(&self) -> usize {
        self.discard_pile.len()
    }

    /// Total cards held by the deck.
    pub fn len(&self) -> usize {
        self.draw_pile.len() + self.discard_pile.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reshuffles(&self) -> u32 {
        self.reshuffles
    }

    /// Whether at least one card can still be drawn.
    pub fn can_draw(&self) -> bool {
        !self.draw_pile.is_empty() || self.discard_pile.len() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::card::{CardId, CardValue, Color, DeckComposition};

    fn standard(seed: u64) -> (Deck, GameRng) {
        let mut rng = GameRng::new(seed);
        let deck = Deck::new(DeckComposition::default().build(), &mut rng);
        (deck, rng)
    }

    #[test]
    fn test_draw_removes_cards() {
        let (mut deck, mut rng) = standard(1);
        let hand = deck.draw(7, &mut rng).unwrap();
        assert_eq!(hand.len(), 7);
        assert_eq!(deck.draw_pile_len(), 101);
    }

    #[test]
    fn test_reshuffle_keeps_top() {
        let (mut deck, mut rng) = standard(2);
        let all = deck.draw(108, &mut rng).unwrap();
        let top_id = all[107].id();
        for card in all {
            deck.discard(card);
        }
        assert_eq!(deck.draw_pile_len(), 0);

        let card = deck.draw_one(&mut rng).unwrap();
        assert_ne!(card.id(), top_id);
        assert_eq!(deck.top().unwrap().id(), top_id);
        assert_eq!(deck.discard_pile_len(), 1);
        assert_eq!(deck.draw_pile_len(), 106);
        assert_eq!(deck.reshuffles(), 1);
    }

    #[test]
    fn test_exhausted_when_only_top_remains() {
        let mut rng = GameRng::new(3);
        let card = Card::new(CardId(0), Color::Red, CardValue::Number(1));
        let mut deck = Deck::new(vec![card], &mut rng);
        let drawn = deck.draw_one(&mut rng).unwrap();
        deck.discard(drawn);
        assert!(!deck.can_draw());
        assert_eq!(
            deck.draw_one(&mut rng),
            Err(InternalConsistencyError::DeckExhausted)
        );
    }

    #[test]
    fn test_draw_up_to_stops_at_top() {
        let mut rng = GameRng::new(5);
        let cards: Vec<Card> = (0..3)
            .map(|i| Card::new(CardId(i), Color::Red, CardValue::Number(i as u8)))
            .collect();
        let mut deck = Deck::new(cards, &mut rng);
        let top = deck.draw_one(&mut rng).unwrap();
        deck.discard(top);
        let drawn = deck.draw_up_to(5, &mut rng);
        assert_eq!(drawn.len(), 2);
        assert_eq!(deck.len(), 1);
    }

    #[test]
    fn test_bury_keeps_top() {
        let (mut deck, mut rng) = standard(4);
        let cards = deck.draw(3, &mut rng).unwrap();
        let top = cards[0];
        deck.discard(top);
        deck.bury(cards[1..].to_vec());
        assert_eq!(deck.top(), Some(&top));
        assert_eq!(deck.discard_pile_len(), 3);
    }

    #[test]
    fn test_shuffle_position_distribution() {
        // Card 0 should land in each quarter of a 20-card deck roughly equally.
        let base: Vec<Card> = (0..20)
            .map(|i| Card::new(CardId(i), Color::Red, CardValue::Number((i % 10) as u8)))
            .collect();
        let mut rng = GameRng::new(42);
        let mut buckets = [0u32; 4];
        let trials = 8000;
        for _ in 0..trials {
            let shuffled = Deck::shuffle(base.clone(), &mut rng);
            let pos = shuffled.iter().position(|c| c.id() == CardId(0)).unwrap();
            buckets[pos / 5] += 1;
        }
        for count in buckets {
            // Expected 2000 per bucket.
            assert!((1700..2300).contains(&count), "bucket count {}", count);
        }
    }
}
