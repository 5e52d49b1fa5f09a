use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use songbird::{
    input::{AudioStream, Input, LiveInput},
    model::payload::{ClientDisconnect, Speaking},
    tracks::{Track, TrackHandle},
    Call, CoreEvent, Event, EventContext, EventHandler as SongbirdEventHandler, Songbird,
    TrackEvent,
};
use std::collections::HashSet;
use std::sync::Arc;
use symphonia::core::io::{MediaSource, ReadOnlySource};
use symphonia::core::probe::Hint;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, warn};

use super::{EventSink, SinkHandle, SinkId, VoiceAdapter, VoiceConnection, VoiceEvent};
use crate::audio::stream::DecodedStream;

/// [`VoiceAdapter`] on top of the songbird voice driver.
pub struct SongbirdAdapter {
    manager: Arc<Songbird>,
}

impl SongbirdAdapter {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl VoiceAdapter for SongbirdAdapter {
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        events: EventSink,
    ) -> Result<Arc<dyn VoiceConnection>> {
        info!("🔗 Conectando al canal {} en guild {}", channel_id, guild_id);

        let call = self
            .manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| anyhow::anyhow!("Error al unirse al canal: {:?}", e))?;

        {
            let mut handler = call.lock().await;
            handler.remove_all_global_events();

            let receiver = DriverEvents::new(guild_id, events.clone());
            for event in [
                CoreEvent::DriverConnect,
                CoreEvent::DriverReconnect,
                CoreEvent::DriverDisconnect,
                CoreEvent::SpeakingStateUpdate,
                CoreEvent::VoiceTick,
                CoreEvent::ClientDisconnect,
            ] {
                handler.add_global_event(event.into(), receiver.clone());
            }
        }

        // DriverConnect may have fired before the handlers were attached
        events.emit(VoiceEvent::Ready);

        info!("✅ Conectado al canal {} en guild {}", channel_id, guild_id);
        Ok(Arc::new(SongbirdConnection {
            guild_id,
            manager: self.manager.clone(),
            call,
            events,
        }))
    }
}

struct SongbirdConnection {
    guild_id: GuildId,
    manager: Arc<Songbird>,
    call: Arc<tokio::sync::Mutex<Call>>,
    events: EventSink,
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    async fn play(
        &self,
        stream: DecodedStream,
        volume: f32,
        sink_id: SinkId,
    ) -> Result<Box<dyn SinkHandle>> {
        let source: Box<dyn MediaSource> = Box::new(ReadOnlySource::new(SyncIoBridge::new(stream)));
        let mut hint = Hint::new();
        hint.with_extension("webm");

        let input = Input::Live(
            LiveInput::Raw(AudioStream {
                input: source,
                hint: Some(hint),
            }),
            None,
        );

        let handle = {
            let mut handler = self.call.lock().await;
            handler.play(Track::new(input).volume(volume))
        };

        handle.add_event(
            Event::Track(TrackEvent::End),
            SinkEnded {
                events: self.events.clone(),
                sink_id,
                failed: false,
            },
        )?;
        handle.add_event(
            Event::Track(TrackEvent::Error),
            SinkEnded {
                events: self.events.clone(),
                sink_id,
                failed: true,
            },
        )?;

        debug!("▶️ Sink {} iniciado en guild {}", sink_id, self.guild_id);
        Ok(Box::new(SongbirdSink { handle }))
    }

    async fn leave(&self) -> Result<()> {
        self.call.lock().await.remove_all_global_events();
        self.manager
            .remove(self.guild_id)
            .await
            .map_err(|e| anyhow::anyhow!("Error al salir del canal: {:?}", e))?;

        info!("👋 Desconectado del canal de voz en guild {}", self.guild_id);
        Ok(())
    }
}

struct SongbirdSink {
    handle: TrackHandle,
}

impl SinkHandle for SongbirdSink {
    fn set_volume(&self, volume: f32) {
        if let Err(e) = self.handle.set_volume(volume) {
            debug!("No se pudo cambiar el volumen: {:?}", e);
        }
    }

    fn pause(&self) {
        if let Err(e) = self.handle.pause() {
            debug!("No se pudo pausar: {:?}", e);
        }
    }

    fn resume(&self) {
        if let Err(e) = self.handle.play() {
            debug!("No se pudo reanudar: {:?}", e);
        }
    }

    fn stop(&self) {
        if let Err(e) = self.handle.stop() {
            debug!("El track ya había terminado: {:?}", e);
        }
    }
}

/// Track end/error handler for one sink.
struct SinkEnded {
    events: EventSink,
    sink_id: SinkId,
    failed: bool,
}

#[async_trait]
impl SongbirdEventHandler for SinkEnded {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if self.failed {
            if let EventContext::Track(tracks) = ctx {
                for (state, _handle) in *tracks {
                    warn!("❌ Error en sink {}: {:?}", self.sink_id, state.playing);
                }
            }
            self.events.emit(VoiceEvent::SinkFailed(self.sink_id));
        } else {
            self.events.emit(VoiceEvent::SinkIdle(self.sink_id));
        }

        None
    }
}

/// Global driver events of one call, translated to [`VoiceEvent`]s.
#[derive(Clone)]
struct DriverEvents {
    inner: Arc<DriverEventsInner>,
}

struct DriverEventsInner {
    guild_id: GuildId,
    events: EventSink,
    known_ssrcs: DashMap<u32, UserId>,
    speaking: Mutex<HashSet<u32>>,
}

impl DriverEvents {
    fn new(guild_id: GuildId, events: EventSink) -> Self {
        Self {
            inner: Arc::new(DriverEventsInner {
                guild_id,
                events,
                known_ssrcs: DashMap::new(),
                speaking: Mutex::new(HashSet::new()),
            }),
        }
    }

    fn user(&self, ssrc: u32) -> Option<UserId> {
        self.inner.known_ssrcs.get(&ssrc).map(|user| *user)
    }

    /// Diffs the ssrcs heard in this tick against the previous one.
    fn on_tick<'a>(&self, heard: impl Iterator<Item = &'a u32>) {
        let heard: HashSet<u32> = heard.copied().collect();

        let (started, stopped) = {
            let mut speaking = self.inner.speaking.lock();
            let started: Vec<u32> = heard.difference(&speaking).copied().collect();
            let stopped: Vec<u32> = speaking.difference(&heard).copied().collect();
            *speaking = heard;
            (started, stopped)
        };

        for ssrc in started {
            if let Some(user) = self.user(ssrc) {
                self.inner.events.emit(VoiceEvent::SpeakingStarted(user));
            }
        }
        for ssrc in stopped {
            if let Some(user) = self.user(ssrc) {
                self.inner.events.emit(VoiceEvent::SpeakingStopped(user));
            }
        }
    }
}

#[async_trait]
impl SongbirdEventHandler for DriverEvents {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::DriverConnect(_) | EventContext::DriverReconnect(_) => {
                info!("🔄 Conexión de voz lista en guild {}", self.inner.guild_id);
                self.inner.events.emit(VoiceEvent::Ready);
            }
            EventContext::DriverDisconnect(data) => {
                warn!(
                    "🔌 Conexión de voz perdida en guild {}: {:?}",
                    self.inner.guild_id, data.reason
                );
                self.inner.speaking.lock().clear();
                self.inner.events.emit(VoiceEvent::Disconnected);
            }
            EventContext::SpeakingStateUpdate(Speaking { ssrc, user_id, .. }) => {
                if let Some(user) = user_id {
                    self.inner.known_ssrcs.insert(*ssrc, UserId::new(user.0));
                }
            }
            EventContext::VoiceTick(tick) => {
                self.on_tick(tick.speaking.keys());
            }
            EventContext::ClientDisconnect(ClientDisconnect { user_id, .. }) => {
                let user = UserId::new(user_id.0);
                let ssrcs: Vec<u32> = self
                    .inner
                    .known_ssrcs
                    .iter()
                    .filter(|entry| *entry.value() == user)
                    .map(|entry| *entry.key())
                    .collect();

                let was_speaking = {
                    let mut speaking = self.inner.speaking.lock();
                    ssrcs.iter().fold(false, |acc, ssrc| speaking.remove(ssrc) || acc)
                };
                for ssrc in &ssrcs {
                    self.inner.known_ssrcs.remove(ssrc);
                }
                if was_speaking {
                    self.inner.events.emit(VoiceEvent::SpeakingStopped(user));
                }
            }
            _ => {}
        }

        None
    }
}
