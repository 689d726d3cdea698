//! Cards and deck composition.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique card identity within a round's deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(pub u32);

/// Card colors. `Wild` is only ever a card's intrinsic color, never the
/// active color of a settled game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    Red,
    Blue,
    Green,
    Yellow,
    Wild,
}

impl Color {
    /// The four colors a player can declare.
    pub const PLAYABLE: [Color; 4] = [Color::Red, Color::Blue, Color::Green, Color::Yellow];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Blue => "blue",
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Wild => "wild",
        }
    }

    pub fn is_wild(&self) -> bool {
        matches!(self, Self::Wild)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Card face value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "value", content = "n", rename_all = "snake_case")]
pub enum CardValue {
    Number(u8),
    Skip,
    Reverse,
    DrawTwo,
    Wild,
    WildDrawFour,
    SwapHands,
    Blank,
}

impl CardValue {
    pub fn kind(&self) -> CardKind {
        match self {
            Self::Number(_) => CardKind::Number,
            Self::Skip | Self::Reverse | Self::DrawTwo => CardKind::Action,
            Self::Wild | Self::WildDrawFour => CardKind::Wild,
            Self::SwapHands | Self::Blank => CardKind::Special,
        }
    }

    /// Cards the next player is forced to draw.
    pub fn draw_penalty(&self) -> u32 {
        match self {
            Self::DrawTwo => 2,
            Self::WildDrawFour => 4,
            _ => 0,
        }
    }

    /// Points this card is worth in a loser's hand.
    pub fn points(&self) -> u32 {
        match self {
            Self::Number(n) => u32::from(*n),
            Self::Skip | Self::Reverse | Self::DrawTwo | Self::Blank => 20,
            Self::SwapHands => 40,
            Self::Wild | Self::WildDrawFour => 50,
        }
    }
}

impl fmt::Display for CardValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Skip => write!(f, "skip"),
            Self::Reverse => write!(f, "reverse"),
            Self::DrawTwo => write!(f, "draw_two"),
            Self::Wild => write!(f, "wild"),
            Self::WildDrawFour => write!(f, "wild_draw_four"),
            Self::SwapHands => write!(f, "swap_hands"),
            Self::Blank => write!(f, "blank"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    Number,
    Action,
    Wild,
    Special,
}

/// A single card. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Card {
    id: CardId,
    color: Color,
    #[serde(flatten)]
    value: CardValue,
}

impl Card {
    pub fn new(id: CardId, color: Color, value: CardValue) -> Self {
        Self { id, color, value }
    }

    pub fn id(&self) -> CardId {
        self.id
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn value(&self) -> CardValue {
        self.value
    }

    pub fn kind(&self) -> CardKind {
        self.value.kind()
    }

    /// Wild-colored cards can be played on anything.
    pub fn is_wild(&self) -> bool {
        self.color.is_wild()
    }

    /// Whether playing this card requires declaring a new active color.
    pub fn needs_color(&self) -> bool {
        matches!(self.value, CardValue::Wild | CardValue::WildDrawFour)
    }

    /// Same color and value (jump-in identity; ids differ).
    pub fn is_identical_to(&self, other: &Card) -> bool {
        !self.is_wild() && self.color == other.color && self.value == other.value
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.color, self.value)
    }
}

/// Which optional cards a deck includes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeckComposition {
    pub blank_cards: bool,
    pub swap_hands: bool,
}

impl DeckComposition {
    /// Number of cards in a deck of this composition.
    pub fn size(&self) -> usize {
        let mut size = 108;
        if self.blank_cards {
            size += 4;
        }
        if self.swap_hands {
            size += 4;
        }
        size
    }

    /// Build the full, unshuffled card list with ids `0..size`.
    pub fn build(&self) -> Vec<Card> {
        let mut cards = Vec::with_capacity(self.size());
        let mut push = |color: Color, value: CardValue| {
            let id = CardId(cards.len() as u32);
            cards.push(Card::new(id, color, value));
        };

        for color in Color::PLAYABLE {
            push(color, CardValue::Number(0));
            for n in 1..=9 {
                push(color, CardValue::Number(n));
                push(color, CardValue::Number(n));
            }
            for value in [CardValue::Skip, CardValue::Reverse, CardValue::DrawTwo] {
                push(color, value);
                push(color, value);
            }
            if self.blank_cards {
                push(color, CardValue::Blank);
            }
        }

        for _ in 0..4 {
            push(Color::Wild, CardValue::Wild);
            push(Color::Wild, CardValue::WildDrawFour);
        }
        if self.swap_hands {
            for _ in 0..4 {
                push(Color::Wild, CardValue::SwapHands);
            }
        }

        cards
    }
}
