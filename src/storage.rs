use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Per-guild playback settings, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuildSettings {
    pub guild_id: u64,
    /// Turn the music down while people are speaking.
    pub duck_enabled: bool,
    /// Volume (0-100) used while someone speaks.
    pub duck_target: Option<u8>,
    /// Seconds to wait on an empty queue before leaving; 0 stays forever.
    pub empty_queue_timeout_secs: u64,
    pub auto_announce_next_song: bool,
    pub default_volume: u8,
}

impl Default for GuildSettings {
    fn default() -> Self {
        Self {
            guild_id: 0,
            duck_enabled: false,
            duck_target: Some(20),
            empty_queue_timeout_secs: 30,
            auto_announce_next_song: false,
            default_volume: 100,
        }
    }
}

/// Source of guild settings for the players.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GuildSettingsProvider: Send + Sync {
    async fn get(&self, guild_id: GuildId) -> Result<GuildSettings>;
}

/// Settings store backed by one JSON file per guild under `<data_dir>/servers`.
pub struct JsonSettingsStore {
    data_dir: PathBuf,
    defaults: GuildSettings,
    servers_cache: Mutex<HashMap<u64, GuildSettings>>,
}

impl JsonSettingsStore {
    /// Opens the store and loads every existing guild file.
    ///
    /// `defaults` is the document written for guilds seen for the first time.
    pub async fn new(data_dir: PathBuf, defaults: GuildSettings) -> Result<Self> {
        fs::create_dir_all(data_dir.join("servers")).await?;

        info!("📁 Storage inicializado en: {}", data_dir.display());

        let store = Self {
            data_dir,
            defaults,
            servers_cache: Mutex::new(HashMap::new()),
        };
        store.load_all_servers().await?;

        Ok(store)
    }

    /// Replaces a guild's settings.
    pub async fn update(&self, settings: GuildSettings) -> Result<()> {
        self.save_settings(&settings).await?;
        info!("💾 Configuración actualizada para guild {}", settings.guild_id);
        self.servers_cache
            .lock()
            .await
            .insert(settings.guild_id, settings);
        Ok(())
    }

    pub async fn set_default_volume(&self, guild_id: GuildId, volume: u8) -> Result<()> {
        let mut settings = self.get(guild_id).await?;
        settings.default_volume = volume.min(100);
        self.update(settings).await
    }

    pub async fn set_ducking(&self, guild_id: GuildId, enabled: bool, target: Option<u8>) -> Result<()> {
        let mut settings = self.get(guild_id).await?;
        settings.duck_enabled = enabled;
        settings.duck_target = target.map(|t| t.min(100));
        self.update(settings).await
    }

    pub async fn list_guilds(&self) -> Vec<u64> {
        let mut guilds: Vec<u64> = self.servers_cache.lock().await.keys().copied().collect();
        guilds.sort_unstable();
        guilds
    }

    async fn load_settings(&self, guild_id: u64) -> Result<GuildSettings> {
        let content = fs::read_to_string(self.settings_path(guild_id)).await?;
        let mut settings: GuildSettings = serde_json::from_str(&content)?;
        settings.guild_id = guild_id;
        Ok(settings)
    }

    async fn save_settings(&self, settings: &GuildSettings) -> Result<()> {
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(self.settings_path(settings.guild_id), content).await?;
        Ok(())
    }

    async fn load_all_servers(&self) -> Result<()> {
        let mut files = fs::read_dir(self.data_dir.join("servers")).await?;
        let mut loaded = HashMap::new();

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            let Some(guild_id) = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };

            match self.load_settings(guild_id).await {
                Ok(settings) => {
                    loaded.insert(guild_id, settings);
                }
                Err(e) => warn!("Error cargando configuración para guild {}: {}", guild_id, e),
            }
        }

        if !loaded.is_empty() {
            info!("📂 Cargadas {} configuraciones de servidor", loaded.len());
        }
        self.servers_cache.lock().await.extend(loaded);

        Ok(())
    }

    fn settings_path(&self, guild_id: u64) -> PathBuf {
        self.data_dir
            .join("servers")
            .join(format!("guild_{}.json", guild_id))
    }
}

#[async_trait]
impl GuildSettingsProvider for JsonSettingsStore {
    async fn get(&self, guild_id: GuildId) -> Result<GuildSettings> {
        let id = guild_id.get();
        let mut cache = self.servers_cache.lock().await;

        if let Some(settings) = cache.get(&id) {
            return Ok(settings.clone());
        }

        let settings = match self.load_settings(id).await {
            Ok(settings) => settings,
            Err(_) => {
                let settings = GuildSettings {
                    guild_id: id,
                    ..self.defaults.clone()
                };
                self.save_settings(&settings).await?;
                info!("📝 Configuración por defecto creada para guild {}", id);
                settings
            }
        };

        cache.insert(id, settings.clone());
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn defaults() -> GuildSettings {
        GuildSettings {
            default_volume: 70,
            empty_queue_timeout_secs: 60,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_access_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSettingsStore::new(dir.path().to_path_buf(), defaults())
            .await
            .unwrap();

        let settings = store.get(GuildId::new(42)).await.unwrap();

        assert_eq!(settings.guild_id, 42);
        assert_eq!(settings.default_volume, 70);
        assert_eq!(settings.empty_queue_timeout_secs, 60);
        assert!(dir.path().join("servers/guild_42.json").exists());
    }

    #[tokio::test]
    async fn settings_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonSettingsStore::new(dir.path().to_path_buf(), defaults())
                .await
                .unwrap();
            store.set_ducking(GuildId::new(7), true, Some(150)).await.unwrap();
            store.set_default_volume(GuildId::new(7), 55).await.unwrap();
        }

        let store = JsonSettingsStore::new(dir.path().to_path_buf(), defaults())
            .await
            .unwrap();
        assert_eq!(store.list_guilds().await, vec![7]);

        let settings = store.get(GuildId::new(7)).await.unwrap();
        assert!(settings.duck_enabled);
        assert_eq!(settings.duck_target, Some(100));
        assert_eq!(settings.default_volume, 55);
    }

    #[tokio::test]
    async fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("servers")).unwrap();
        std::fs::write(
            dir.path().join("servers/guild_9.json"),
            r#"{"duck_enabled": true}"#,
        )
        .unwrap();

        let store = JsonSettingsStore::new(dir.path().to_path_buf(), defaults())
            .await
            .unwrap();
        let settings = store.get(GuildId::new(9)).await.unwrap();

        assert_eq!(settings.guild_id, 9);
        assert!(settings.duck_enabled);
        assert_eq!(settings.duck_target, Some(20));
        assert_eq!(settings.default_volume, 100);
    }
}
