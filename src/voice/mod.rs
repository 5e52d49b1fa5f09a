//! # Voice Module
//!
//! The seam between a guild player and the voice gateway.
//!
//! A [`VoiceAdapter`] joins a channel and hands back a [`VoiceConnection`]
//! that can play a [`DecodedStream`] as a sink. Everything the connection
//! observes (connection state, who is speaking, sinks running out) is
//! reported through the [`EventSink`] given at join time, tagged with the
//! session it belongs to so that the player can drop events from a session
//! it already left.

pub mod driver;

use anyhow::Result;
use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::audio::stream::DecodedStream;

pub use driver::SongbirdAdapter;

/// Identifies one played stream within a player.
pub type SinkId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceEvent {
    /// The connection is up and can play (initial connect or reconnect).
    Ready,
    /// The driver lost the connection.
    Disconnected,
    SpeakingStarted(UserId),
    SpeakingStopped(UserId),
    /// The sink reached the end of its stream, or was stopped.
    SinkIdle(SinkId),
    SinkFailed(SinkId),
}

/// A [`VoiceEvent`] together with the session that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: u64,
    pub event: VoiceEvent,
}

/// Where a connection reports its events.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(session: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Returns `false` once the receiving player is gone.
    pub fn emit(&self, event: VoiceEvent) -> bool {
        self.tx
            .send(SessionEvent {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

#[async_trait]
pub trait VoiceAdapter: Send + Sync {
    /// Joins `channel_id`. Any listener left over from an earlier join of the
    /// same guild is detached before the new ones are attached.
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        events: EventSink,
    ) -> Result<Arc<dyn VoiceConnection>>;
}

#[async_trait]
pub trait VoiceConnection: Send + Sync {
    /// Starts playing `stream` at `volume` (0.0 to 1.0).
    async fn play(
        &self,
        stream: DecodedStream,
        volume: f32,
        sink_id: SinkId,
    ) -> Result<Box<dyn SinkHandle>>;

    async fn leave(&self) -> Result<()>;
}

/// Control over a playing stream.
pub trait SinkHandle: Send + Sync {
    fn set_volume(&self, volume: f32);
    fn pause(&self);
    fn resume(&self);
    fn stop(&self);
}

/// Maps a 0 to 100 volume level onto the sink's gain.
pub fn gain(level: u8) -> f32 {
    f32::from(level.min(100)) / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn events_carry_their_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(3, tx);

        assert!(sink.emit(VoiceEvent::Ready));
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent {
                session: 3,
                event: VoiceEvent::Ready
            }
        );

        drop(rx);
        assert!(!sink.emit(VoiceEvent::Disconnected));
    }

    #[test]
    fn gain_is_clamped() {
        assert_eq!(gain(0), 0.0);
        assert_eq!(gain(50), 0.5);
        assert_eq!(gain(250), 1.0);
    }
}
