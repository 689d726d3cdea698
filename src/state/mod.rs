//! State management for UNO rooms.
//!
//! - `card`, `deck` - Card model, deck composition, draw/discard piles
//! - `rules` - Pure legality checks and effect resolution
//! - `game` - The per-room state machine; every mutation yields a [`Delta`]
//! - `room` - One game plus its client connections and outbox
//! - `manager` - Room codes, locking and delivery
//! - `connection` - Reconnect grace and replay buffers
//! - `bot` - Decision policy for bot seats
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            RoomManager                              │
//! │                                                                     │
//! │  room_code → RoomSlot ─────────────────────────────┐                │
//! │                                                    ▼                │
//! │  ┌──────────────────────────────────────────────────────────────┐  │
//! │  │ Room                                                          │  │
//! │  │                                                               │  │
//! │  │  ┌─────────────────────┐    ┌──────────────────────────────┐  │  │
//! │  │  │ GameState           │    │ ConnectionRegistry           │  │  │
//! │  │  │  players, Deck      │    │  player_id → Connection      │  │  │
//! │  │  │  turn, color, seq   │    │   (grace, ack, replay)       │  │  │
//! │  │  └─────────┬───────────┘    └──────────────────────────────┘  │  │
//! │  │            │ Delta                          ▲                 │  │
//! │  │            └──────── per-viewer messages ───┴──▶ outbox       │  │
//! │  └──────────────────────────────────────────────────────────────┘  │
//! │                                     │ after unlock                  │
//! │                                     ▼                               │
//! │                              Broadcaster::send                      │
//! └─────────────────────────────────────────────────────────────────────┘
//!
//! GameStatus:
//!
//!   WaitingForPlayers ──▶ InProgress ──▶ RoundOver ──▶ InProgress ...
//!          │                  │              │
//!          └──────────────────┴──────────────┴──▶ Ended / Terminated
//! ```
//!
//! # Usage
//!
//! ```rust
//! use chrono::Utc;
//! use std::sync::Arc;
//! use uno_state::config::ServerConfig;
//! use uno_state::state::{RecordingBroadcaster, RoomManager};
//!
//! let broadcaster = Arc::new(RecordingBroadcaster::new());
//! let manager = RoomManager::with_seed(ServerConfig::default(), broadcaster.clone(), 7);
//!
//! let now = Utc::now();
//! let (code, host) = manager.create_room("Alice", None, now).unwrap();
//! let _bob = manager.join_room(&code, "Bob", now).unwrap();
//! manager.start_game(&code, host, None, now).unwrap();
//!
//! assert!(manager.inspect(&code, |game| game.status.is_active()).unwrap());
//! ```

pub mod bot;
pub mod card;
pub mod connection;
pub mod deck;
pub mod game;
pub mod manager;
pub mod player;
pub mod rng;
pub mod room;
pub mod rules;
pub mod settings;
pub mod status;

pub use card::{Card, CardId, CardKind, CardValue, Color, DeckComposition};
pub use connection::{Connection, ConnectionRegistry, ConnectionStatus, PendingMessage, Replay};
pub use deck::Deck;
pub use game::{
    Action, CalloutWindow, Change, Delta, Direction, DrawReason, GameState, GameView,
    PendingEffect, PendingView, Phase, StatusSummary, TimeoutKind,
};
pub use manager::{Broadcaster, CleanupResult, Dispatch, RecordingBroadcaster, RoomManager, Session};
pub use player::{Player, PlayerId, PublicPlayer};
pub use rng::GameRng;
pub use room::{Outbound, Room, RoomSummary};
pub use settings::{GameSettings, GameSpeed};
pub use status::{GameStatus, InvalidTransition, StatusEvent};
