use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rampart::prelude::*;
use rampart::protocol::JsonCodec;

const DEFAULT_BIND: &str = "127.0.0.1:8080";
const WAVE_INTERVAL: Duration = Duration::from_secs(10);
/// Persistent coins each player earns per wave survived.
const WAVE_REWARD: u64 = 25;
const STARTING_HEALTH: u32 = 20;
/// Enemies one archer tower stops per wave.
const TOWER_STOPS: u32 = 3;

// ---------------------------------------------------------------------------
// Match simulation
// ---------------------------------------------------------------------------

struct Match {
    wave: u32,
    health: u32,
    towers: Vec<TowerInfo>,
    coins: BTreeMap<PlayerId, u64>,
}

/// What a wave did to the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaveResult {
    Survived,
    Lost { wave: u32 },
}

impl Match {
    fn new() -> Self {
        Self {
            wave: 0,
            health: STARTING_HEALTH,
            towers: Vec::new(),
            coins: BTreeMap::new(),
        }
    }

    /// Plays the next wave. Every player gets an archer on their first
    /// wave; enemies the towers cannot stop hit the base.
    fn play_wave(&mut self, players: &[PlayerId]) -> WaveResult {
        for &player in players {
            if !self.towers.iter().any(|t| t.owner == player) {
                let id = self.towers.len() as u64 + 1;
                self.towers.push(TowerInfo {
                    id,
                    kind: "archer".into(),
                    owner: player,
                    level: 1,
                    tile: TilePosition {
                        x: id as i32 * 2,
                        z: 0,
                    },
                });
            }
            *self.coins.entry(player).or_default() += WAVE_REWARD;
        }

        self.wave += 1;
        let enemies = self.wave * 2;
        let stopped = self.towers.len() as u32 * TOWER_STOPS;
        self.health = self.health.saturating_sub(enemies.saturating_sub(stopped));

        if self.health == 0 {
            let wave = self.wave;
            *self = Self::new();
            return WaveResult::Lost { wave };
        }
        WaveResult::Survived
    }

    fn snapshot(&self) -> GameInfo {
        GameInfo {
            towers: self.towers.clone(),
            coins: self.coins.clone(),
            wave: self.wave,
            wave_ready: true,
            time_until_wave_start: WAVE_INTERVAL.as_secs() as u32,
            health: self.health,
            ..GameInfo::default()
        }
    }
}

/// Plays a wave every `period` while anyone is connected, saving rewards
/// to each player's data and broadcasting the match state.
async fn run_waves(handle: ServerHandle<JsonCodec>, period: Duration) {
    let mut game = Match::new();
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let players = handle.sessions().open_players();
        if players.is_empty() {
            continue;
        }

        let result = game.play_wave(&players);
        let wave = game.wave;
        for &player in &players {
            let saved = handle
                .sessions()
                .mutate(player, |data| match result {
                    WaveResult::Survived => {
                        data.award_coins(WAVE_REWARD);
                        data.highest_wave = data.highest_wave.max(wave);
                    }
                    WaveResult::Lost { wave } => data.record_game(wave),
                })
                .await;
            if let Err(e) = saved {
                // The player left between the snapshot and the update.
                tracing::debug!(%player, error = %e, "skipping wave reward");
            }
        }

        if let WaveResult::Lost { wave } = result {
            tracing::info!(wave, "base destroyed, starting a new match");
        }
        match handle.broadcast_game_info(&game.snapshot()) {
            Ok(reached) => tracing::debug!(wave = game.wave, reached, "wave played"),
            Err(e) => tracing::warn!(error = %e, "game info broadcast failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Server bootstrap
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), RampartError> {
    rampart::init_tracing();

    let addr = std::env::var("RAMPART_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let backend = Arc::new(MemoryBackend::<PlayerData>::new());

    let server = RampartServerBuilder::new()
        .bind(&addr)
        .build(backend, NumericTokenAuthenticator)
        .await?;
    tracing::info!(%addr, "tower-defense server listening");

    let waves = tokio::spawn(run_waves(server.handle(), WAVE_INTERVAL));
    let result = server.run().await;
    waves.abort();
    result
}
