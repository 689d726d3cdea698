//! Room snapshot persistence.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::game::GameState;

/// Errors surfaced by snapshot stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot store lock was poisoned")]
    LockPoisoned,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything needed to resume a room after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_code: String,
    pub game: GameState,
    /// Last applied sequence number.
    pub seq: u64,
    pub saved_at: DateTime<Utc>,
}

impl RoomSnapshot {
    pub fn capture(game: &GameState, now: DateTime<Utc>) -> Self {
        Self {
            room_code: game.room_code.clone(),
            game: game.clone(),
            seq: game.seq(),
            saved_at: now,
        }
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Storage for room snapshots, keyed by room code.
pub trait SnapshotStore: Send + Sync {
    /// Save a snapshot, replacing any older one for the same room.
    fn save(&self, snapshot: RoomSnapshot) -> Result<(), StoreError>;

    fn load(&self, room_code: &str) -> Result<Option<RoomSnapshot>, StoreError>;

    fn delete(&self, room_code: &str) -> Result<(), StoreError>;

    /// All stored snapshots, ordered by room code.
    fn load_all(&self) -> Result<Vec<RoomSnapshot>, StoreError>;
}

/// In-memory implementation of SnapshotStore for tests and local runs.
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, RoomSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&self, snapshot: RoomSnapshot) -> Result<(), StoreError> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        // Never replace a newer snapshot with an older one.
        if let Some(existing) = snapshots.get(&snapshot.room_code) {
            if existing.seq > snapshot.seq {
                return Ok(());
            }
        }
        snapshots.insert(snapshot.room_code.clone(), snapshot);
        Ok(())
    }

    fn load(&self, room_code: &str) -> Result<Option<RoomSnapshot>, StoreError> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(snapshots.get(room_code).cloned())
    }

    fn delete(&self, room_code: &str) -> Result<(), StoreError> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        snapshots.remove(room_code);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<RoomSnapshot>, StoreError> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        let mut all: Vec<RoomSnapshot> = snapshots.values().cloned().collect();
        all.sort_by(|a, b| a.room_code.cmp(&b.room_code));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::player::{Player, PlayerId};
    use crate::state::rng::GameRng;
    use crate::state::settings::GameSettings;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn game(code: &str) -> GameState {
        let mut game = GameState::new(code, GameSettings::default(), GameRng::new(3));
        game.add_player(Player::new(PlayerId(1), "A"), false).unwrap();
        game.add_player(Player::new(PlayerId(2), "B"), false).unwrap();
        game
    }

    #[test]
    fn test_save_and_load() {
        let store = InMemorySnapshotStore::new();
        store.save(RoomSnapshot::capture(&game("ROOMA1"), t0())).unwrap();

        let loaded = store.load("ROOMA1").unwrap().unwrap();
        assert_eq!(loaded.seq, 2);
        assert!(store.load("NOPE").unwrap().is_none());

        store.delete("ROOMA1").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_older_snapshot_does_not_overwrite() {
        let store = InMemorySnapshotStore::new();
        let mut g = game("ROOMB2");
        let old = RoomSnapshot::capture(&g, t0());
        g.start_round(GameSettings::default(), t0()).unwrap();
        store.save(RoomSnapshot::capture(&g, t0())).unwrap();
        store.save(old).unwrap();
        assert_eq!(store.load("ROOMB2").unwrap().unwrap().seq, 3);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut g = game("ROOMC3");
        g.start_round(GameSettings::default(), t0()).unwrap();
        let snapshot = RoomSnapshot::capture(&g, t0());
        let restored = RoomSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(restored, snapshot);
    }

    #[test]
    fn test_load_all_sorted() {
        let store = InMemorySnapshotStore::new();
        for code in ["ZZZZZZ", "AAAAAA", "MMMMMM"] {
            store.save(RoomSnapshot::capture(&game(code), t0())).unwrap();
        }
        let codes: Vec<String> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|s| s.room_code)
            .collect();
        assert_eq!(codes, vec!["AAAAAA", "MMMMMM", "ZZZZZZ"]);
    }
}
