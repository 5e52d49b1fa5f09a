use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::ResolveError;

/// Input-side options for one transcode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputOptions {
    /// Start position in seconds.
    pub seek: Option<u64>,
    /// End position in seconds.
    pub to: Option<u64>,
    /// Reconnect on dropped HTTP connections (fresh remote fetches only).
    pub reconnect: bool,
    /// Read the input at its native rate.
    pub realtime: bool,
}

impl InputOptions {
    /// ffmpeg arguments placed before `-i`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.realtime {
            args.push("-re".to_string());
        }

        if self.reconnect {
            args.extend(
                [
                    "-reconnect",
                    "1",
                    "-reconnect_streamed",
                    "1",
                    "-reconnect_delay_max",
                    "5",
                ]
                .map(String::from),
            );
        }

        if let Some(seek) = self.seek {
            args.push("-ss".to_string());
            args.push(seek.to_string());
        }

        if let Some(to) = self.to {
            args.push("-to".to_string());
            args.push(to.to_string());
        }

        args
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeRequest {
    /// URL or file path handed to the transcoder.
    pub input: String,
    pub options: InputOptions,
    /// Argument of the `volume` audio filter, e.g. `1` or `-3.5dB`.
    pub volume: String,
}

/// Handle used to kill a running transcode.
pub trait TranscodeProcess: Send {
    fn kill(&mut self);
}

impl TranscodeProcess for Child {
    fn kill(&mut self) {
        if let Err(e) = self.start_kill() {
            debug!("ffmpeg ya había terminado: {}", e);
        }
    }
}

/// A started transcode: its output bytes and the process producing them.
pub struct TranscodeOutput {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub process: Box<dyn TranscodeProcess>,
}

/// Turns an input locator into opus-in-webm bytes.
#[async_trait]
pub trait AudioTranscoder: Send + Sync {
    async fn transcode(&self, request: TranscodeRequest) -> Result<TranscodeOutput, ResolveError>;
}

/// [`AudioTranscoder`] that spawns `ffmpeg`.
pub struct FfmpegTranscoder {
    binary: String,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn build_args(request: &TranscodeRequest) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
            .map(String::from)
            .to_vec();
        args.extend(request.options.to_args());
        args.extend(
            [
                "-i".to_string(),
                request.input.clone(),
                "-vn".to_string(),
                "-c:a".to_string(),
                "libopus".to_string(),
                "-filter:a".to_string(),
                format!("volume={}", request.volume),
                "-f".to_string(),
                "webm".to_string(),
                "pipe:1".to_string(),
            ],
        );
        args
    }
}

#[async_trait]
impl AudioTranscoder for FfmpegTranscoder {
    async fn transcode(&self, request: TranscodeRequest) -> Result<TranscodeOutput, ResolveError> {
        let args = Self::build_args(&request);

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ResolveError::stream)?;

        info!("🎛️ ffmpeg iniciado: {} {}", self.binary, args.join(" "));

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("ffmpeg: {}", line);
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ResolveError::stream(anyhow::anyhow!("ffmpeg sin stdout")))?;

        Ok(TranscodeOutput {
            reader: Box::new(stdout),
            process: Box::new(child),
        })
    }
}
