use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

mod bot;

use crate::bot::JukeboxBot;
use guild_jukebox::audio::formats::YtDlpFormatSource;
use guild_jukebox::audio::player::PlayerDeps;
use guild_jukebox::audio::registry::PlayerRegistry;
use guild_jukebox::audio::resolver::StreamResolver;
use guild_jukebox::audio::transcoder::FfmpegTranscoder;
use guild_jukebox::cache::{ContentCache, FileCache};
use guild_jukebox::config::Config;
use guild_jukebox::storage::JsonSettingsStore;
use guild_jukebox::voice::SongbirdAdapter;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guild_jukebox=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    // El health check no necesita token
    if std::env::args().any(|arg| arg == "--health-check") {
        dotenvy::dotenv().ok();
        let defaults = Config::default();
        return health_check(
            &std::env::var("FFMPEG_PATH").unwrap_or(defaults.ffmpeg_path),
            &std::env::var("YTDLP_PATH").unwrap_or(defaults.ytdlp_path),
        )
        .await;
    }

    info!("🎵 Iniciando Guild Jukebox v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("{}", config.summary());

    // Caché de audio
    let cache = Arc::new(FileCache::new(config.cache_dir.clone()).await?);
    if let Err(e) = cache.cleanup().await {
        warn!("⚠️ Error limpiando la caché: {:?}", e);
    }

    // Configuración por servidor
    let settings = Arc::new(
        JsonSettingsStore::new(config.data_dir.clone(), config.guild_defaults()).await?,
    );

    let songbird = Songbird::serenity();
    let (notifications, _) = broadcast::channel(64);

    let resolver = StreamResolver::new(
        cache,
        Arc::new(FfmpegTranscoder::new(config.ffmpeg_path.clone())),
        Arc::new(YtDlpFormatSource::new(config.ytdlp_path.clone())),
    );
    let registry = Arc::new(PlayerRegistry::new(PlayerDeps {
        resolver: Arc::new(resolver),
        voice: Arc::new(SongbirdAdapter::new(songbird.clone())),
        settings,
        notifications,
    }));

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(JukeboxBot::new(registry.clone()))
        .register_songbird_with(songbird)
        .await?;

    tokio::spawn(bot::run_announcer(client.http.clone(), registry.subscribe()));

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        shard_manager.shutdown_all().await;
    });

    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

async fn health_check(ffmpeg: &str, ytdlp: &str) -> Result<()> {
    let yt_dlp = async_process::Command::new(ytdlp)
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = async_process::Command::new(ffmpeg)
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes");
    }
}
