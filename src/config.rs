//! Server-wide configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::settings::{self, GameSettings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{field} must be at least {min}, got {value}")]
    TooSmall {
        field: &'static str,
        min: usize,
        value: usize,
    },

    #[error("{field} must be at most {max}, got {value}")]
    TooLarge {
        field: &'static str,
        max: usize,
        value: usize,
    },
}

/// Limits and defaults shared by every room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub max_players_per_room: usize,
    pub min_players_to_start: usize,
    pub room_code_length: usize,
    pub reconnect_grace_secs: i64,
    pub allow_late_join: bool,
    pub persist_snapshots: bool,
    pub default_settings: GameSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_players_per_room: 10,
            min_players_to_start: 2,
            room_code_length: 6,
            reconnect_grace_secs: 60,
            allow_late_join: false,
            persist_snapshots: true,
            default_settings: GameSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Parse and validate a JSON config. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("maxPlayersPerRoom", 2, self.max_players_per_room),
            ("minPlayersToStart", 2, self.min_players_to_start),
            ("roomCodeLength", 4, self.room_code_length),
        ];
        for (field, min, value) in checks {
            if value < min {
                return Err(ConfigError::TooSmall { field, min, value });
            }
        }

        let limits = [
            ("maxPlayersPerRoom", settings::max_seats(), self.max_players_per_room),
            ("minPlayersToStart", self.max_players_per_room, self.min_players_to_start),
        ];
        for (field, max, value) in limits {
            if value > max {
                return Err(ConfigError::TooLarge { field, max, value });
            }
        }
        Ok(())
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::seconds(self.reconnect_grace_secs.max(0))
    }
}
