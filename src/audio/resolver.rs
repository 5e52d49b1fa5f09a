use std::sync::Arc;
use tracing::{debug, info, warn};

use super::formats::{select_format, FormatSource};
use super::song::{Song, SourceType};
use super::stream::{self, DecodedStream};
use super::transcoder::{
    AudioTranscoder, InputOptions, TranscodeOutput, TranscodeProcess, TranscodeRequest,
};
use crate::cache::{cache_key, CachedEntry, ContentCache};
use crate::error::ResolveError;

/// Songs at least this long (in seconds) are never cached.
const MAX_CACHEABLE_LENGTH: u64 = 30 * 60;

/// Where to start and stop inside the source, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResolveOptions {
    pub seek: Option<u64>,
    pub to: Option<u64>,
}

/// Turns queued songs into playable streams, going through the content cache
/// whenever possible.
pub struct StreamResolver {
    cache: Arc<dyn ContentCache>,
    transcoder: Arc<dyn AudioTranscoder>,
    formats: Arc<dyn FormatSource>,
}

impl StreamResolver {
    pub fn new(
        cache: Arc<dyn ContentCache>,
        transcoder: Arc<dyn AudioTranscoder>,
        formats: Arc<dyn FormatSource>,
    ) -> Self {
        Self {
            cache,
            transcoder,
            formats,
        }
    }

    pub async fn resolve(
        &self,
        song: &Song,
        options: ResolveOptions,
    ) -> Result<DecodedStream, ResolveError> {
        if song.source == SourceType::Hls {
            return self.resolve_hls(song).await;
        }

        let key = cache_key(&song.url);

        if let Some(entry) = self.cache.try_get_path(&key).await {
            return self.resolve_cached(song, entry, options).await;
        }

        let info = self
            .formats
            .probe(&song.url)
            .await
            .map_err(ResolveError::stream)?;

        let is_live = info.is_live || song.is_live;
        let format = select_format(&info.formats, is_live).ok_or(ResolveError::NoSuitableFormat)?;

        let length = if song.length > 0 { song.length } else { info.duration };
        let cacheable =
            options.seek.unwrap_or(0) == 0 && !is_live && length < MAX_CACHEABLE_LENGTH;

        let volume = match format.loudness_db {
            Some(loudness) => format!("{}dB", -loudness),
            None => "1".to_string(),
        };

        let request = TranscodeRequest {
            input: format.url.clone(),
            options: InputOptions {
                seek: options.seek,
                to: options.to,
                reconnect: true,
                realtime: false,
            },
            volume,
        };

        let mut output = self.transcoder.transcode(request).await?;
        let first = stream::read_first_chunk(&mut output)
            .await
            .map_err(ResolveError::stream)?;

        let sink = if cacheable {
            match self.cache.open_write_sink(&key).await {
                Ok(sink) => Some(sink),
                Err(e) => {
                    warn!("⚠️ Caché no disponible para {}: {}", song.title, e);
                    None
                }
            }
        } else {
            None
        };

        info!(
            "🌐 Stream remoto: {} (live: {}, caché: {})",
            song.title,
            is_live,
            sink.is_some()
        );
        Ok(stream::start(output, first, sink, song.title.clone()))
    }

    async fn resolve_cached(
        &self,
        song: &Song,
        entry: CachedEntry,
        options: ResolveOptions,
    ) -> Result<DecodedStream, ResolveError> {
        debug!("📦 Reproduciendo desde caché: {}", entry.path().display());

        let request = TranscodeRequest {
            input: entry.path().to_string_lossy().into_owned(),
            options: InputOptions {
                seek: options.seek,
                to: options.to,
                ..Default::default()
            },
            volume: "1".to_string(),
        };

        let output = self.transcoder.transcode(request).await?;
        let mut output = TranscodeOutput {
            reader: output.reader,
            process: Box::new(LeasedProcess {
                process: output.process,
                _entry: entry,
            }),
        };
        let first = stream::read_first_chunk(&mut output)
            .await
            .map_err(ResolveError::stream)?;

        info!("📦 Cache hit: {}", song.title);
        Ok(stream::start(output, first, None, song.title.clone()))
    }

    /// Direct streams are read in realtime from their start; seeking does
    /// not apply.
    async fn resolve_hls(&self, song: &Song) -> Result<DecodedStream, ResolveError> {
        let request = TranscodeRequest {
            input: song.url.clone(),
            options: InputOptions {
                realtime: true,
                ..Default::default()
            },
            volume: "1".to_string(),
        };

        let mut output = self.transcoder.transcode(request).await?;
        let first = stream::read_first_chunk(&mut output)
            .await
            .map_err(ResolveError::stream)?;

        info!("📡 Stream HLS: {}", song.title);
        Ok(stream::start(output, first, None, song.title.clone()))
    }
}

/// Keeps a cache entry leased for as long as it is being transcoded.
struct LeasedProcess {
    process: Box<dyn TranscodeProcess>,
    _entry: CachedEntry,
}

impl TranscodeProcess for LeasedProcess {
    fn kill(&mut self) {
        self.process.kill();
    }
}
