//! Per-guild voice playback engine for Discord music bots.
//!
//! The [`audio::registry::PlayerRegistry`] hands out one
//! [`audio::player::GuildPlayer`] per guild. Players stream songs through the
//! [`audio::resolver::StreamResolver`], which keeps finished transcodes in a
//! [`cache::ContentCache`], and play them on a [`voice::VoiceAdapter`].

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod storage;
pub mod voice;
