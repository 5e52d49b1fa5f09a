//! # Audio Module
//!
//! Per-guild playback: the queue, the player state machine and everything
//! needed to turn a queued song into bytes the voice driver can play.
//!
//! ## Architecture
//!
//! ### [`registry`] - Player Registry
//! - One [`GuildPlayer`](player::GuildPlayer) per guild, created on first use
//!
//! ### [`player`] - Guild Player
//! - Playback state machine (Idle, Playing, Paused) over a [`queue::MusicQueue`]
//! - Loop policies, volume, ducking and the empty-queue timeout
//! - Serializes commands and voice events on a single lock
//!
//! ### [`resolver`] - Stream Resolution
//! - Cache lookup, format selection through [`formats`] and transcoding
//!   through [`transcoder`]
//! - [`stream`] fans the transcoded bytes out to playback and the cache
//!
//! ## Example
//!
//! ```rust,no_run
//! use guild_jukebox::audio::player::PlayOptions;
//! use guild_jukebox::audio::registry::PlayerRegistry;
//! use guild_jukebox::audio::song::{QueuedSong, Song, SourceType};
//! use serenity::model::id::{ChannelId, GuildId, UserId};
//!
//! # async fn example(registry: &PlayerRegistry) -> anyhow::Result<()> {
//! let player = registry.get(GuildId::new(1));
//! let song = Song::new("Lofi radio", "https://radio.example/live.m3u8", SourceType::Hls).live();
//!
//! player.add(QueuedSong::new(song, ChannelId::new(2), UserId::new(3)), false).await;
//! player.connect(ChannelId::new(4)).await?;
//! player.play(PlayOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod formats;
pub mod player;
pub mod position;
pub mod queue;
pub mod registry;
pub mod resolver;
pub mod song;
pub mod speech;
pub mod stream;
pub mod transcoder;
