//! Payloads carried inside [`Message::PlayerData`](crate::Message::PlayerData)
//! and [`Message::GameInfo`](crate::Message::GameInfo).
//!
//! Field names are camelCase on the wire to match the game client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::PlayerId;

// ---------------------------------------------------------------------------
// PlayerData
// ---------------------------------------------------------------------------

/// Everything persisted for one player between matches.
///
/// `#[serde(default)]` on the struct means a record written before a field
/// existed still loads, with the missing field at its default. Records
/// written by a *newer* schema are rejected by the backend instead (see
/// the document layer's backwards-compatibility check).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayerData {
    /// Persistent currency.
    pub coins: u64,
    /// Total experience earned.
    pub experience: u64,
    /// Tower kinds the player may place.
    pub unlocked_towers: Vec<String>,
    /// Matches finished (won or lost).
    pub games_played: u32,
    /// Best wave reached in any match.
    pub highest_wave: u32,
}

impl Default for PlayerData {
    fn default() -> Self {
        Self {
            coins: 0,
            experience: 0,
            unlocked_towers: vec!["archer".to_string()],
            games_played: 0,
            highest_wave: 0,
        }
    }
}

impl PlayerData {
    /// Adds coins, saturating instead of overflowing.
    pub fn award_coins(&mut self, amount: u64) {
        self.coins = self.coins.saturating_add(amount);
    }

    /// Removes coins if the player can afford it. Returns `false` (and
    /// leaves the balance alone) otherwise.
    pub fn spend_coins(&mut self, amount: u64) -> bool {
        match self.coins.checked_sub(amount) {
            Some(rest) => {
                self.coins = rest;
                true
            }
            None => false,
        }
    }

    /// Unlocks a tower kind. Returns `false` if it was already unlocked.
    pub fn unlock_tower(&mut self, kind: &str) -> bool {
        if self.unlocked_towers.iter().any(|t| t == kind) {
            return false;
        }
        self.unlocked_towers.push(kind.to_string());
        true
    }

    /// Records a finished match that reached `wave`.
    pub fn record_game(&mut self, wave: u32) {
        self.games_played = self.games_played.saturating_add(1);
        self.highest_wave = self.highest_wave.max(wave);
    }
}

// ---------------------------------------------------------------------------
// GameInfo
// ---------------------------------------------------------------------------

/// Grid coordinates of the tile a tower stands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilePosition {
    pub x: i32,
    pub z: i32,
}

/// One placed tower, as the client needs to draw and select it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TowerInfo {
    pub id: u64,
    pub kind: String,
    pub owner: PlayerId,
    pub level: u32,
    pub tile: TilePosition,
}

/// Wave/economy snapshot of a running match, broadcast to every
/// connected player.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameInfo {
    pub towers: Vec<TowerInfo>,
    /// In-match coins per player (separate from persisted coins).
    pub coins: BTreeMap<PlayerId, u64>,
    pub wave: u32,
    /// Whether the next wave has been generated and can start.
    pub wave_ready: bool,
    pub wave_start_votes: Vec<PlayerId>,
    pub wave_autostart_votes: Vec<PlayerId>,
    pub time_until_wave_start: u32,
    pub restart_votes: Vec<PlayerId>,
    /// Base health left; the match is lost at zero.
    pub health: u32,
}
