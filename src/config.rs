use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::storage::GuildSettings;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,

    // Audio
    /// Volume (0-100) for guilds that never changed theirs.
    pub default_volume: u8,
    /// Seconds on an empty queue before leaving the channel; 0 stays forever.
    pub empty_queue_timeout_secs: u64,

    // Paths
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,

    // Binarios externos
    pub ffmpeg_path: String,
    pub ytdlp_path: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            discord_token: std::env::var("DISCORD_TOKEN").context("DISCORD_TOKEN no definido")?,

            default_volume: env_or("DEFAULT_VOLUME", defaults.default_volume)?,
            empty_queue_timeout_secs: env_or(
                "EMPTY_QUEUE_TIMEOUT",
                defaults.empty_queue_timeout_secs,
            )?,

            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            cache_dir: std::env::var("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),

            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or(defaults.ffmpeg_path),
            ytdlp_path: std::env::var("YTDLP_PATH").unwrap_or(defaults.ytdlp_path),
        };

        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.cache_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Sanity checks on the loaded values.
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_TOKEN must not be empty");
        }

        if self.default_volume > 100 {
            anyhow::bail!(
                "Default volume must be between 0 and 100, got: {}",
                self.default_volume
            );
        }

        if self.ffmpeg_path.trim().is_empty() || self.ytdlp_path.trim().is_empty() {
            anyhow::bail!("ffmpeg and yt-dlp paths must not be empty");
        }

        Ok(())
    }

    /// Settings document written for guilds seen for the first time.
    pub fn guild_defaults(&self) -> GuildSettings {
        GuildSettings {
            default_volume: self.default_volume,
            empty_queue_timeout_secs: self.empty_queue_timeout_secs,
            ..Default::default()
        }
    }

    /// Token-free summary for the startup log.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Audio: {}% vol, {}\n  \
            Paths: data={}, cache={}\n  \
            Tools: ffmpeg={}, yt-dlp={}",
            self.default_volume,
            match self.empty_queue_timeout_secs {
                0 => "sin desconexión automática".to_string(),
                secs => format!(
                    "desconexión tras {}",
                    humantime::format_duration(std::time::Duration::from_secs(secs))
                ),
            },
            self.data_dir.display(),
            self.cache_dir.display(),
            self.ffmpeg_path,
            self.ytdlp_path
        )
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => val
            .trim()
            .parse()
            .with_context(|| format!("{} inválido: {}", key, val)),
        _ => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no default, must be provided)
            discord_token: String::new(),

            default_volume: 100,
            empty_queue_timeout_secs: 30,

            data_dir: "/app/data".into(),
            cache_dir: "/app/cache".into(),

            ffmpeg_path: "ffmpeg".to_string(),
            ytdlp_path: "yt-dlp".to_string(),
        }
    }
}
