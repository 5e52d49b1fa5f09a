use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, UserId};
use std::time::Duration;

/// Where a song's audio comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    /// A remote page whose formats have to be probed before streaming.
    YouTube,
    /// A direct HLS/HTTP stream, transcoded as-is.
    Hls,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::YouTube => "youtube",
            SourceType::Hls => "hls",
        }
    }
}

/// Playlist a song was enqueued from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedPlaylist {
    pub title: String,
    pub source: String,
}

/// Metadata of a playable song.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub title: String,
    pub artist: String,
    /// Canonical source locator; the cache key is derived from it.
    pub url: String,
    /// Length in seconds.
    pub length: u64,
    /// Start offset in seconds into the source.
    pub offset: u64,
    pub playlist: Option<QueuedPlaylist>,
    pub is_live: bool,
    pub thumbnail_url: Option<String>,
    pub source: SourceType,
}

impl Song {
    pub fn new(title: impl Into<String>, url: impl Into<String>, source: SourceType) -> Self {
        Self {
            title: title.into(),
            artist: String::new(),
            url: url.into(),
            length: 0,
            offset: 0,
            playlist: None,
            is_live: false,
            thumbnail_url: None,
            source,
        }
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = artist.into();
        self
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.length = length;
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_playlist(mut self, playlist: QueuedPlaylist) -> Self {
        self.playlist = Some(playlist);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail_url: impl Into<String>) -> Self {
        self.thumbnail_url = Some(thumbnail_url.into());
        self
    }

    pub fn live(mut self) -> Self {
        self.is_live = true;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.length)
    }
}

/// A song sitting in a guild's queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSong {
    pub song: Song,
    /// Text channel the song was requested from; announcements go there.
    pub added_in_channel_id: ChannelId,
    pub requested_by: UserId,
    pub added_at: DateTime<Utc>,
}

impl QueuedSong {
    pub fn new(song: Song, added_in_channel_id: ChannelId, requested_by: UserId) -> Self {
        Self {
            song,
            added_in_channel_id,
            requested_by,
            added_at: Utc::now(),
        }
    }

    pub fn title(&self) -> &str {
        &self.song.title
    }

    pub fn url(&self) -> &str {
        &self.song.url
    }
}

impl std::fmt::Display for QueuedSong {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.song.is_live {
            write!(f, "{} (live)", self.song.title)
        } else {
            write!(
                f,
                "{} [{}]",
                self.song.title,
                humantime::format_duration(self.song.duration())
            )
        }
    }
}
