use bytes::{Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::transcoder::TranscodeOutput;
use crate::cache::CacheSink;

const CHUNK_SIZE: usize = 16 * 1024;

/// Chunks buffered ahead of the player before the transcoder is throttled.
const PLAYBACK_BUFFER: usize = 32;

/// Forward-only opus-in-webm byte stream handed to the voice connection.
///
/// Reaching the end of the transcoder output is a regular EOF; a transcoder
/// read failure surfaces as an I/O error.
#[derive(Debug)]
pub struct DecodedStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    pending: Bytes,
}

impl DecodedStream {
    fn new(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
        }
    }

    /// A stream over fixed content.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(Ok(data.into()));
        Self::new(rx)
    }
}

impl AsyncRead for DecodedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                let chunk = self.pending.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }

            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.pending = chunk,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

enum CacheChunk {
    Data(Bytes),
    End,
}

/// Moves transcoder output to the player and, optionally, to a cache sink.
///
/// The cache side is fed through an unbounded channel and written by its own
/// task, so a slow disk never holds back playback. When the player goes away
/// the transcoder is killed, unless a cache entry is being written; then the
/// rest of the output is drained into the cache in the background.
pub fn start(
    output: TranscodeOutput,
    first_chunk: Bytes,
    cache_sink: Option<Box<dyn CacheSink>>,
    label: String,
) -> DecodedStream {
    let (tx, rx) = mpsc::channel(PLAYBACK_BUFFER);
    let cache = cache_sink.map(|sink| spawn_cache_writer(sink, label.clone()));

    let pump = Pump {
        output,
        playback: Some(tx),
        cache,
        label,
    };
    tokio::spawn(pump.run(first_chunk));

    DecodedStream::new(rx)
}

/// Reads the first chunk of a freshly started transcode.
///
/// An empty first read means the transcoder exited without output.
pub async fn read_first_chunk(output: &mut TranscodeOutput) -> io::Result<Bytes> {
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    let read = output.reader.read_buf(&mut buf).await?;
    if read == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "transcoder exited without output",
        ));
    }
    Ok(buf.freeze())
}

struct Pump {
    output: TranscodeOutput,
    playback: Option<mpsc::Sender<io::Result<Bytes>>>,
    cache: Option<mpsc::UnboundedSender<CacheChunk>>,
    label: String,
}

impl Pump {
    async fn run(mut self, first_chunk: Bytes) {
        let mut next = Some(first_chunk);

        loop {
            let chunk = match next.take() {
                Some(chunk) => chunk,
                None => match self.read().await {
                    Some(Ok(chunk)) if chunk.is_empty() => {
                        self.finish_cache();
                        debug!("🏁 Fin del stream: {}", self.label);
                        return;
                    }
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        warn!("⚠️ Error leyendo el stream de {}: {}", self.label, e);
                        // dropping the cache sender without End discards the entry
                        self.cache = None;
                        if let Some(tx) = self.playback.take() {
                            let _ = tx.send(Err(e)).await;
                        }
                        return;
                    }
                    None => {
                        self.on_playback_closed();
                        if self.cache.is_none() {
                            return;
                        }
                        continue;
                    }
                },
            };

            let cache_gone = match &self.cache {
                Some(cache) => cache.send(CacheChunk::Data(chunk.clone())).is_err(),
                None => false,
            };
            if cache_gone {
                self.cache = None;
            }

            let playback_gone = match &self.playback {
                Some(tx) => tx.send(Ok(chunk)).await.is_err(),
                None => false,
            };
            if playback_gone {
                self.on_playback_closed();
            }

            if self.playback.is_none() && self.cache.is_none() {
                self.output.process.kill();
                return;
            }
        }
    }

    /// Reads the next chunk. `None` means the player went away while waiting.
    async fn read(&mut self) -> Option<io::Result<Bytes>> {
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);

        let result = match &self.playback {
            Some(tx) => tokio::select! {
                result = self.output.reader.read_buf(&mut buf) => result,
                _ = tx.closed() => return None,
            },
            None => self.output.reader.read_buf(&mut buf).await,
        };

        Some(result.map(|_| buf.freeze()))
    }

    fn on_playback_closed(&mut self) {
        if self.playback.take().is_none() {
            return;
        }

        if self.cache.is_some() {
            debug!("💾 Reproducción cerrada, completando caché de {}", self.label);
        } else {
            debug!("🔪 Reproducción cerrada, deteniendo transcodificación de {}", self.label);
            self.output.process.kill();
        }
    }

    fn finish_cache(&mut self) {
        if let Some(cache) = self.cache.take() {
            let _ = cache.send(CacheChunk::End);
        }
    }
}

fn spawn_cache_writer(
    mut sink: Box<dyn CacheSink>,
    label: String,
) -> mpsc::UnboundedSender<CacheChunk> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            match chunk {
                CacheChunk::Data(bytes) => {
                    if let Err(e) = sink.write(&bytes).await {
                        warn!("⚠️ No se pudo escribir en caché {}: {}", label, e);
                        return;
                    }
                }
                CacheChunk::End => {
                    match sink.finish().await {
                        Ok(()) => info!("💾 Guardado en caché: {}", label),
                        Err(e) => warn!("⚠️ No se pudo completar la caché de {}: {}", label, e),
                    }
                    return;
                }
            }
        }
        debug!("Caché de {} descartada", label);
    });

    tx
}
