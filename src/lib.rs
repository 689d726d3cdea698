//! UNO State Library
//!
//! Server-authoritative state management for multiplayer UNO.
//!
//! # Overview
//!
//! - **Rules** - Card legality, action cards, stacking, jump-in, seven-O and
//!   Uno callouts, resolved as pure functions over the game state.
//!
//! - **Game State Machine** - One ordered stream of mutations per room. Every
//!   accepted action bumps a sequence number and produces a delta.
//!
//! - **Rooms and Sessions** - Room codes, host handling, bots, reconnect grace
//!   with replay buffers.
//!
//! - **Sync Protocol** - Client/server message types, per-viewer deltas with
//!   hidden hands, gap detection.
//!
//! # Design Principles
//!
//! 1. **The server decides** - Clients send intents; rejected actions change
//!    nothing.
//!
//! 2. **Time is an argument** - Every operation takes `now`, so timeouts are
//!    deterministic under test.
//!
//! 3. **No networking** - Delivery goes through the [`Broadcaster`] trait.
//!
//! 4. **Serialization-ready** - Game state, snapshots and messages are all
//!    serde types.
//!
//! # Example
//!
//! ```rust
//! use uno_state::protocol::{ClientEnvelope, ClientMessage};
//! use uno_state::{RecordingBroadcaster, RoomManager, ServerConfig};
//! use chrono::Utc;
//! use std::sync::Arc;
//!
//! let broadcaster = Arc::new(RecordingBroadcaster::new());
//! let manager = RoomManager::with_seed(ServerConfig::default(), broadcaster.clone(), 1);
//!
//! let create = ClientEnvelope::new(ClientMessage::CreateRoom {
//!     player_name: "Alice".into(),
//!     settings: None,
//! });
//! let host = manager.dispatch(None, create, Utc::now()).session.unwrap();
//!
//! let add_bot = ClientEnvelope::new(ClientMessage::AddBot { name: None });
//! manager.dispatch(Some(&host), add_bot, Utc::now());
//!
//! let start = ClientEnvelope::new(ClientMessage::StartGame { settings: None });
//! let reply = manager.dispatch(Some(&host), start, Utc::now()).reply;
//! assert!(reply.is_none());
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod state;
pub mod store;

pub use config::ServerConfig;
pub use error::{ActionError, InternalConsistencyError, RoomError, ValidationError};
pub use protocol::{ClientEnvelope, ClientMessage, ServerMessage, SyncTracker};
pub use state::*;
pub use store::{InMemorySnapshotStore, RoomSnapshot, SnapshotStore};
