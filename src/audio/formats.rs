use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::cmp::Reverse;
use tracing::{debug, info, warn};

/// Itags that are known to carry usable audio for live broadcasts.
const LIVE_AUDIO_ITAGS: [u32; 7] = [128, 127, 120, 96, 95, 94, 93];

/// One downloadable rendition of a remote media page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaFormat {
    pub url: String,
    pub itag: Option<u32>,
    pub codec: Option<String>,
    pub container: Option<String>,
    pub audio_sample_rate: Option<u32>,
    /// Audio bitrate in kbps.
    pub audio_bitrate: Option<u32>,
    /// Average bitrate in bps.
    pub average_bitrate: Option<u32>,
    /// Fixed bitrate in bps; `None` for adaptive renditions.
    pub bitrate: Option<u32>,
    /// Loudness offset reported by the source, in dB. When present the
    /// transcoder attenuates by it; when absent the gain is left at unity.
    pub loudness_db: Option<f32>,
}

impl MediaFormat {
    fn is_webm_opus_48k(&self) -> bool {
        self.codec.as_deref() == Some("opus")
            && self.container.as_deref() == Some("webm")
            && self.audio_sample_rate == Some(48_000)
    }
}

/// Everything the resolver needs to know about a remote locator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    pub formats: Vec<MediaFormat>,
    pub is_live: bool,
    /// Length in seconds.
    pub duration: u64,
}

/// Looks up the candidate formats of a remote song.
///
/// Implementations fill [`MediaFormat::loudness_db`] only when the backing
/// service reports a loudness offset. yt-dlp does not expose one, so
/// [`YtDlpFormatSource`] always leaves it unset and those songs play without
/// normalisation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FormatSource: Send + Sync {
    async fn probe(&self, locator: &str) -> Result<MediaInfo>;
}

/// Picks the rendition to stream.
///
/// Opus in webm at 48kHz is taken as-is. Otherwise live streams use the
/// highest audio bitrate among the known live itags, and everything else the
/// highest average bitrate, preferring an adaptive rendition when several
/// share that bitrate.
pub fn select_format(formats: &[MediaFormat], is_live: bool) -> Option<&MediaFormat> {
    if let Some(format) = formats.iter().find(|f| f.is_webm_opus_48k()) {
        return Some(format);
    }

    if is_live {
        let mut candidates: Vec<&MediaFormat> = formats.iter().collect();
        candidates.sort_by_key(|f| Reverse(f.audio_bitrate.unwrap_or(0)));
        return candidates
            .into_iter()
            .find(|f| f.itag.is_some_and(|itag| LIVE_AUDIO_ITAGS.contains(&itag)));
    }

    let mut candidates: Vec<&MediaFormat> = formats
        .iter()
        .filter(|f| f.average_bitrate.is_some())
        .collect();
    candidates.sort_by_key(|f| Reverse(f.average_bitrate));

    let best = candidates.first()?.average_bitrate;
    candidates
        .iter()
        .take_while(|f| f.average_bitrate == best)
        .find(|f| f.bitrate.is_none())
        .or_else(|| candidates.first())
        .copied()
}

/// [`FormatSource`] backed by `yt-dlp -J`. Never reports loudness.
pub struct YtDlpFormatSource {
    binary: String,
}

impl YtDlpFormatSource {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl FormatSource for YtDlpFormatSource {
    async fn probe(&self, locator: &str) -> Result<MediaInfo> {
        debug!("🔍 Obteniendo formatos con yt-dlp: {}", locator);

        let output = tokio::process::Command::new(&self.binary)
            .args([
                "-J",
                "--no-playlist",
                "--no-warnings",
                "--socket-timeout",
                "30",
            ])
            .arg(locator)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("no se pudo ejecutar {}", self.binary))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp falló para {}: {}", locator, error.trim());
            anyhow::bail!("yt-dlp info failed: {}", error.trim());
        }

        let info = parse_ytdlp_info(&output.stdout)?;
        info!(
            "📋 {} formatos para {} (live: {})",
            info.formats.len(),
            locator,
            info.is_live
        );
        Ok(info)
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    #[serde(default)]
    is_live: Option<bool>,
    #[serde(default)]
    live_status: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    url: Option<String>,
    ext: Option<String>,
    acodec: Option<String>,
    vcodec: Option<String>,
    asr: Option<u32>,
    abr: Option<f64>,
    tbr: Option<f64>,
}

fn parse_ytdlp_info(raw: &[u8]) -> Result<MediaInfo> {
    let info: YtDlpInfo = serde_json::from_slice(raw).context("salida de yt-dlp inválida")?;

    let is_live =
        info.is_live.unwrap_or(false) || info.live_status.as_deref() == Some("is_live");

    let formats = info
        .formats
        .into_iter()
        .filter(|f| f.acodec.as_deref() != Some("none"))
        .filter_map(|f| {
            let url = f.url?;
            let has_video = f.vcodec.as_deref().is_some_and(|v| v != "none");
            Some(MediaFormat {
                url,
                itag: f.format_id.parse().ok(),
                codec: f.acodec,
                container: f.ext,
                audio_sample_rate: f.asr,
                audio_bitrate: f.abr.map(|abr| abr.round() as u32),
                average_bitrate: f.tbr.map(|tbr| (tbr * 1000.0).round() as u32),
                // muxed renditions are served at a fixed rate, audio-only ones are adaptive
                bitrate: if has_video {
                    f.tbr.map(|tbr| (tbr * 1000.0).round() as u32)
                } else {
                    None
                },
                // yt-dlp has no loudness field for any extractor
                loudness_db: None,
            })
        })
        .collect();

    Ok(MediaInfo {
        formats,
        is_live,
        duration: info.duration.map_or(0, |d| d.round() as u64),
    })
}
