//! # Bot Module
//!
//! Gateway glue for the binary: a serenity [`EventHandler`] that keeps the
//! players in step with the bot's own voice state, and the announcer that
//! posts player notifications to text channels.
//!
//! Command parsing and registration live outside this crate; whatever
//! front end is used drives the players through the [`PlayerRegistry`].

use serenity::{
    all::{Context, EventHandler, Ready, VoiceState},
    async_trait,
    http::Http,
};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use guild_jukebox::audio::player::{NotificationKind, PlayerNotification};
use guild_jukebox::audio::registry::PlayerRegistry;

pub struct JukeboxBot {
    registry: Arc<PlayerRegistry>,
}

impl JukeboxBot {
    pub fn new(registry: Arc<PlayerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventHandler for JukeboxBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());
    }

    /// Closes the guild's voice session when someone disconnects the bot by
    /// hand. The queue is kept for the next `connect`.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id {
            return;
        }

        let Some(guild_id) = new.guild_id else {
            return;
        };

        match (old.and_then(|s| s.channel_id), new.channel_id) {
            (Some(_), None) => {
                info!("🔌 Bot desconectado en guild {}", guild_id);
                if let Some(player) = self.registry.get_existing(guild_id) {
                    if player.channel_id().await.is_some() {
                        player.disconnect().await;
                    }
                }
            }
            (Some(from), Some(to)) if from != to => {
                debug!("🔀 Bot movido de {} a {} en guild {}", from, to, guild_id);
            }
            _ => {}
        }
    }
}

/// Posts player notifications to the text channel they belong to, until the
/// notification channel closes.
pub async fn run_announcer(http: Arc<Http>, mut notifications: broadcast::Receiver<PlayerNotification>) {
    loop {
        let notification = match notifications.recv().await {
            Ok(notification) => notification,
            Err(RecvError::Lagged(skipped)) => {
                warn!("⚠️ Se omitieron {} notificaciones", skipped);
                continue;
            }
            Err(RecvError::Closed) => return,
        };

        let Some(channel_id) = notification.channel_id else {
            continue;
        };

        let message = render(&notification.kind);
        if let Err(e) = channel_id.say(&*http, message).await {
            error!("❌ Error al anunciar en {}: {:?}", channel_id, e);
        }
    }
}

fn render(kind: &NotificationKind) -> String {
    match kind {
        NotificationKind::NowPlaying(song) => {
            let mut message = format!("🎵 Reproduciendo: **{}**", song);
            if !song.song.artist.is_empty() {
                message.push_str(&format!(" de {}", song.song.artist));
            }
            message.push_str(&format!(" (pedido por <@{}>)", song.requested_by));
            message
        }
        NotificationKind::QueueEnded => "📭 La cola ha terminado".to_string(),
        NotificationKind::SongUnavailable { song, reason } => {
            format!("🚫 No se pudo reproducir **{}**: {}", song.title(), reason)
        }
    }
}
