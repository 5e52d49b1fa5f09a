use dashmap::DashMap;
use serenity::model::id::GuildId;
use tokio::sync::broadcast;
use tracing::debug;

use super::player::{GuildPlayer, PlayerDeps, PlayerNotification};

/// One [`GuildPlayer`] per guild, created on first use and kept for the
/// lifetime of the process.
pub struct PlayerRegistry {
    players: DashMap<GuildId, GuildPlayer>,
    deps: PlayerDeps,
}

impl PlayerRegistry {
    pub fn new(deps: PlayerDeps) -> Self {
        Self {
            players: DashMap::new(),
            deps,
        }
    }

    /// Returns the guild's player, creating it if needed. Concurrent callers
    /// for the same guild get the same player.
    pub fn get(&self, guild_id: GuildId) -> GuildPlayer {
        self.players
            .entry(guild_id)
            .or_insert_with(|| {
                debug!("🎛️ Nuevo reproductor para guild {}", guild_id);
                GuildPlayer::new(guild_id, self.deps.clone())
            })
            .clone()
    }

    pub fn get_existing(&self, guild_id: GuildId) -> Option<GuildPlayer> {
        self.players.get(&guild_id).map(|player| player.clone())
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Notifications from every player.
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerNotification> {
        self.deps.notifications.subscribe()
    }
}
