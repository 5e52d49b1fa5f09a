use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::position::PositionTracker;
use super::queue::{ForwardOutcome, MusicQueue};
use super::resolver::{ResolveOptions, StreamResolver};
use super::song::QueuedSong;
use super::speech::SpeechActivityMonitor;
use crate::error::{PlayerError, PlayerResult, ResolveError};
use crate::storage::{GuildSettings, GuildSettingsProvider};
use crate::voice::{
    gain, EventSink, SessionEvent, SinkHandle, SinkId, VoiceAdapter, VoiceConnection, VoiceEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Playing,
    Paused,
    Idle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayOptions {
    /// Position in seconds to start from.
    pub seek: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationKind {
    NowPlaying(QueuedSong),
    QueueEnded,
    SongUnavailable { song: QueuedSong, reason: String },
}

/// Something the bot should tell the guild about.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerNotification {
    pub guild_id: GuildId,
    /// Text channel to announce in, if one is known.
    pub channel_id: Option<ChannelId>,
    pub kind: NotificationKind,
}

/// Read-only view of a player, for status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSnapshot {
    pub status: PlayerStatus,
    pub current: Option<QueuedSong>,
    pub upcoming: Vec<QueuedSong>,
    pub position: u64,
    pub volume: u8,
    pub loop_song: bool,
    pub loop_queue: bool,
    pub channel_id: Option<ChannelId>,
}

/// Collaborators shared by every player.
#[derive(Clone)]
pub struct PlayerDeps {
    pub resolver: Arc<StreamResolver>,
    pub voice: Arc<dyn VoiceAdapter>,
    pub settings: Arc<dyn GuildSettingsProvider>,
    pub notifications: broadcast::Sender<PlayerNotification>,
}

struct VoiceSession {
    id: u64,
    channel_id: ChannelId,
    connection: Arc<dyn VoiceConnection>,
    speech: SpeechActivityMonitor,
    /// Speaking events only change the volume while ducking is enabled.
    listening: bool,
}

struct ActiveSink {
    id: SinkId,
    handle: Box<dyn SinkHandle>,
    song: QueuedSong,
}

/// A start whose stream is being resolved with the state unlocked.
struct PendingStart {
    generation: u64,
    connection: Arc<dyn VoiceConnection>,
    song: QueuedSong,
    options: ResolveOptions,
    token: CancellationToken,
}

/// Playback requested by a voice event, started after the event's lock is
/// released.
struct FollowUp {
    options: PlayOptions,
    announce: bool,
}

struct State {
    queue: MusicQueue,
    status: PlayerStatus,
    loop_song: bool,
    loop_queue: bool,
    /// Explicit volume; `None` falls back to the guild default.
    volume: Option<u8>,
    settings: GuildSettings,
    session: Option<VoiceSession>,
    sessions_started: u64,
    sink: Option<ActiveSink>,
    sinks_started: SinkId,
    /// Bumped whenever playback is halted; a start only installs its sink if
    /// the value is unchanged since it began.
    play_generation: u64,
    position: PositionTracker,
    idle_timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    announce_channel: Option<ChannelId>,
}

impl State {
    fn volume(&self) -> u8 {
        self.volume.unwrap_or(self.settings.default_volume)
    }
}

struct Inner {
    guild_id: GuildId,
    deps: PlayerDeps,
    state: Mutex<State>,
    resolving: parking_lot::Mutex<Option<CancellationToken>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    timeouts_tx: mpsc::UnboundedSender<u64>,
}

/// Playback state machine and queue of one guild.
///
/// Cheap to clone; all clones drive the same player. Operations and voice
/// events are serialized on one lock. The lock is not held while a song is
/// being resolved or a voice channel joined, so status queries and queue
/// edits answer immediately; a start that was overtaken by another
/// operation in the meantime is discarded with [`ResolveError::Cancelled`].
#[derive(Clone)]
pub struct GuildPlayer {
    inner: Arc<Inner>,
}

impl GuildPlayer {
    /// Creates the player and spawns its event task. Must be called within a
    /// tokio runtime.
    pub fn new(guild_id: GuildId, deps: PlayerDeps) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timeouts_tx, timeouts_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            guild_id,
            deps,
            state: Mutex::new(State {
                queue: MusicQueue::new(),
                status: PlayerStatus::Idle,
                loop_song: false,
                loop_queue: false,
                volume: None,
                settings: GuildSettings::default(),
                session: None,
                sessions_started: 0,
                sink: None,
                sinks_started: 0,
                play_generation: 0,
                position: PositionTracker::new(),
                idle_timer: None,
                timer_generation: 0,
                announce_channel: None,
            }),
            resolving: parking_lot::Mutex::new(None),
            events_tx,
            timeouts_tx,
        });

        tokio::spawn(run_events(Arc::downgrade(&inner), events_rx, timeouts_rx));

        Self { inner }
    }

    pub fn guild_id(&self) -> GuildId {
        self.inner.guild_id
    }

    // ---- connection ----

    /// Joins `channel_id`, replacing any current session.
    ///
    /// If something was playing it is picked up again in the new session.
    pub async fn connect(&self, channel_id: ChannelId) -> PlayerResult<()> {
        let settings = self.load_settings().await;

        let (session_id, events, resume_at) = {
            let mut state = self.inner.state.lock().await;
            state.settings = settings;
            self.cancel_idle_timer(&mut state);

            let was_playing = state.status == PlayerStatus::Playing;
            if state.session.is_some() {
                self.teardown_session(&mut state, false).await;
            }
            let resume_at = was_playing.then(|| self.resume_position(&state));

            state.sessions_started += 1;
            let session_id = state.sessions_started;
            let events = EventSink::new(session_id, self.inner.events_tx.clone());
            (session_id, events, resume_at)
        };

        let connection = self
            .inner
            .deps
            .voice
            .join(self.inner.guild_id, channel_id, events)
            .await
            .map_err(PlayerError::Connection)?;

        {
            let mut state = self.inner.state.lock().await;

            if state.sessions_started != session_id {
                debug!("Sesión de voz {} reemplazada antes de completarse", session_id);
                if state.session.is_none() {
                    if let Err(e) = connection.leave().await {
                        warn!("⚠️ Error al salir del canal de voz: {}", e);
                    }
                }
                return Err(PlayerError::NotConnected);
            }

            // a finished join is a ready connection
            let listening = state.settings.duck_enabled;
            state.session = Some(VoiceSession {
                id: session_id,
                channel_id,
                connection,
                speech: SpeechActivityMonitor::new(),
                listening,
            });
            info!("🔗 Sesión de voz {} en guild {}", session_id, self.inner.guild_id);
        }

        if let Some(seek) = resume_at {
            self.play_current(PlayOptions { seek }).await?;
        }

        Ok(())
    }

    /// Leaves the voice channel and forgets the queue. Loop flags are kept.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;

        self.cancel_idle_timer(&mut state);
        self.teardown_session(&mut state, true).await;
        state.queue.reset();
        state.status = PlayerStatus::Idle;
        state.position.reset();

        info!("⏹️ Reproducción detenida en guild {}", self.inner.guild_id);
    }

    /// Leaves the voice channel but keeps the queue and loop flags.
    ///
    /// Playback that was running becomes Paused at its position, and
    /// `resume` picks it up again after the next `connect`.
    pub async fn disconnect(&self) {
        let mut state = self.inner.state.lock().await;

        self.cancel_idle_timer(&mut state);
        self.teardown_session(&mut state, true).await;

        info!(
            "🔌 Sesión de voz cerrada en guild {} ({} canciones en cola)",
            self.inner.guild_id,
            state.queue.size()
        );
    }

    // ---- playback ----

    pub async fn play(&self, options: PlayOptions) -> PlayerResult<()> {
        self.play_current(options).await
    }

    /// Restarts the current song at `offset` seconds.
    pub async fn seek(&self, offset: u64) -> PlayerResult<()> {
        {
            let state = self.inner.state.lock().await;
            let current = state.queue.current().ok_or(PlayerError::QueueEnded)?;
            if offset > current.song.length {
                return Err(PlayerError::SeekOutOfRange);
            }
        }

        self.play_current(PlayOptions { seek: Some(offset) }).await
    }

    pub async fn pause(&self) -> PlayerResult<()> {
        let mut state = self.inner.state.lock().await;

        if state.status != PlayerStatus::Playing {
            return Err(PlayerError::NotPlaying);
        }

        state.status = PlayerStatus::Paused;
        if let Some(sink) = &state.sink {
            sink.handle.pause();
        }
        state.position.stop();

        info!("⏸️ Reproducción pausada en {}s", state.position.get());
        Ok(())
    }

    pub async fn resume(&self) -> PlayerResult<()> {
        let seek = {
            let mut state = self.inner.state.lock().await;

            if state.status != PlayerStatus::Paused {
                return Err(PlayerError::NotPaused);
            }

            let current = state.queue.current().cloned().ok_or(PlayerError::QueueEnded)?;

            let same_sink = state
                .sink
                .as_ref()
                .is_some_and(|sink| sink.song.url() == current.url());

            if same_sink && state.session.is_some() {
                if let Some(sink) = &state.sink {
                    sink.handle.resume();
                }
                state.status = PlayerStatus::Playing;
                state.position.start(None);
                info!("▶️ Reproducción reanudada");
                return Ok(());
            }

            self.resume_position(&state)
        };

        self.play_current(PlayOptions { seek }).await
    }

    /// Skips `skip` songs and plays the new current one unless paused.
    pub async fn forward(&self, skip: usize) -> PlayerResult<ForwardOutcome> {
        let (outcome, start) = {
            let mut state = self.inner.state.lock().await;
            self.advance_locked(&mut state, skip)
        };

        if start {
            self.play_current(PlayOptions::default()).await?;
        }
        Ok(outcome)
    }

    /// Moves the cursor forward and stops whatever was playing, without
    /// starting the new current song.
    pub async fn manual_forward(&self, skip: usize) -> ForwardOutcome {
        let mut state = self.inner.state.lock().await;
        self.manual_forward_locked(&mut state, skip)
    }

    pub async fn back(&self) -> PlayerResult<()> {
        let start = {
            let mut state = self.inner.state.lock().await;

            state.queue.back()?;
            self.halt(&mut state);
            state.position.reset();
            self.should_autoplay(&state)
        };

        if start {
            self.play_current(PlayOptions::default()).await?;
        }
        Ok(())
    }

    pub async fn set_volume(&self, level: u8) {
        let mut state = self.inner.state.lock().await;
        self.set_volume_locked(&mut state, level);
    }

    pub async fn volume(&self) -> u8 {
        self.inner.state.lock().await.volume()
    }

    // ---- queue ----

    pub async fn add(&self, song: QueuedSong, immediate: bool) {
        self.inner.state.lock().await.queue.add(song, immediate);
    }

    pub async fn shuffle(&self) {
        self.inner.state.lock().await.queue.shuffle();
    }

    pub async fn clear(&self) {
        self.inner.state.lock().await.queue.clear();
    }

    pub async fn remove_from_queue(&self, index: usize, amount: usize) -> PlayerResult<()> {
        self.inner.state.lock().await.queue.remove(index, amount)
    }

    /// Removes the current song. When it was playing, the song that takes
    /// its slot starts in its place.
    pub async fn remove_current(&self) -> PlayerResult<Option<QueuedSong>> {
        let (removed, start) = {
            let mut state = self.inner.state.lock().await;

            let Some(removed) = state.queue.remove_current() else {
                return Ok(None);
            };
            info!("🗑️ Canción actual eliminada: {}", removed.title());

            let mut start = false;
            if state.status != PlayerStatus::Idle {
                self.halt(&mut state);
                state.position.reset();
                if state.queue.current().is_some() {
                    start = self.should_autoplay(&state);
                } else {
                    self.queue_ran_out(&mut state);
                }
            }
            (removed, start)
        };

        if start {
            self.play_current(PlayOptions::default()).await?;
        }
        Ok(Some(removed))
    }

    pub async fn move_song(&self, from: usize, to: usize) -> PlayerResult<QueuedSong> {
        let mut state = self.inner.state.lock().await;
        state.queue.move_song(from, to).cloned()
    }

    pub async fn can_go_forward(&self, skip: usize) -> bool {
        self.inner.state.lock().await.queue.can_go_forward(skip)
    }

    pub async fn can_go_back(&self) -> bool {
        self.inner.state.lock().await.queue.can_go_back()
    }

    // ---- loop flags ----

    pub async fn set_loop_song(&self, enabled: bool) {
        let mut state = self.inner.state.lock().await;
        state.loop_song = enabled;
        if enabled {
            state.loop_queue = false;
        }
    }

    pub async fn set_loop_queue(&self, enabled: bool) {
        let mut state = self.inner.state.lock().await;
        state.loop_queue = enabled;
        if enabled {
            state.loop_song = false;
        }
    }

    /// Returns the new value.
    pub async fn toggle_loop_song(&self) -> bool {
        let enabled = !self.loop_song().await;
        self.set_loop_song(enabled).await;
        enabled
    }

    /// Returns the new value.
    pub async fn toggle_loop_queue(&self) -> bool {
        let enabled = !self.loop_queue().await;
        self.set_loop_queue(enabled).await;
        enabled
    }

    // ---- accessors ----

    pub async fn status(&self) -> PlayerStatus {
        self.inner.state.lock().await.status
    }

    pub async fn current(&self) -> Option<QueuedSong> {
        self.inner.state.lock().await.queue.current().cloned()
    }

    pub async fn upcoming(&self) -> Vec<QueuedSong> {
        self.inner.state.lock().await.queue.upcoming().to_vec()
    }

    pub async fn queue_size(&self) -> usize {
        self.inner.state.lock().await.queue.size()
    }

    pub async fn is_queue_empty(&self) -> bool {
        self.inner.state.lock().await.queue.is_empty()
    }

    /// Seconds into the current song.
    pub async fn position(&self) -> u64 {
        self.inner.state.lock().await.position.get()
    }

    pub async fn loop_song(&self) -> bool {
        self.inner.state.lock().await.loop_song
    }

    pub async fn loop_queue(&self) -> bool {
        self.inner.state.lock().await.loop_queue
    }

    /// Voice channel of the current session.
    pub async fn channel_id(&self) -> Option<ChannelId> {
        self.inner
            .state
            .lock()
            .await
            .session
            .as_ref()
            .map(|s| s.channel_id)
    }

    pub async fn snapshot(&self) -> PlayerSnapshot {
        let state = self.inner.state.lock().await;
        PlayerSnapshot {
            status: state.status,
            current: state.queue.current().cloned(),
            upcoming: state.queue.upcoming().to_vec(),
            position: state.position.get(),
            volume: state.volume(),
            loop_song: state.loop_song,
            loop_queue: state.loop_queue,
            channel_id: state.session.as_ref().map(|s| s.channel_id),
        }
    }

    // ---- internals ----

    /// Starts the current song, skipping past songs that can't be played.
    /// The first failure is returned even when a later song started.
    async fn play_current(&self, options: PlayOptions) -> PlayerResult<()> {
        let error = match self.start_current(options).await {
            Ok(()) => return Ok(()),
            Err(error) if is_unplayable(&error) => error,
            Err(error) => return Err(error),
        };

        // at most once around the queue
        let mut failure = error.to_string();
        let attempts = self.inner.state.lock().await.queue.len();
        for _ in 0..attempts {
            {
                let mut state = self.inner.state.lock().await;
                if state.status != PlayerStatus::Idle {
                    // another operation took over meanwhile
                    break;
                }

                if let Some(song) = state.queue.current().cloned() {
                    warn!("🚫 Canción no disponible: {} ({})", song.title(), failure);
                    self.notify(
                        Some(song.added_in_channel_id),
                        NotificationKind::SongUnavailable {
                            song,
                            reason: failure.clone(),
                        },
                    );
                }

                if state.queue.forward(1) == ForwardOutcome::QueueEnded
                    || state.queue.current().is_none()
                {
                    self.queue_ran_out(&mut state);
                    break;
                }
            }

            match self.start_current(PlayOptions::default()).await {
                Ok(()) => break,
                Err(next) if is_unplayable(&next) => failure = next.to_string(),
                Err(next) => {
                    error!("❌ Error al reproducir la siguiente canción: {}", next);
                    break;
                }
            }
        }

        Err(error)
    }

    /// Starts the current song on the voice connection. The stream is
    /// resolved with the state unlocked.
    async fn start_current(&self, options: PlayOptions) -> PlayerResult<()> {
        let pending = {
            let mut state = self.inner.state.lock().await;
            self.begin_start(&mut state, options)?
        };

        let resolved = tokio::select! {
            result = self.inner.deps.resolver.resolve(&pending.song.song, pending.options) => result,
            _ = pending.token.cancelled() => Err(ResolveError::Cancelled),
        };

        let mut state = self.inner.state.lock().await;
        if state.play_generation != pending.generation {
            debug!("Inicio de {} descartado, la reproducción cambió", pending.song.title());
            return Err(PlayerError::Resolve(ResolveError::Cancelled));
        }
        self.inner.resolving.lock().take();

        let stream = match resolved {
            Ok(stream) => stream,
            Err(e) => {
                self.start_failed(&mut state);
                return Err(e.into());
            }
        };

        state.sinks_started += 1;
        let sink_id = state.sinks_started;
        let handle = match pending
            .connection
            .play(stream, gain(state.volume()), sink_id)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.start_failed(&mut state);
                return Err(PlayerError::Connection(e));
            }
        };

        // paused while loading
        if state.status == PlayerStatus::Paused {
            handle.pause();
        } else {
            state.position.start(None);
        }
        state.announce_channel = Some(pending.song.added_in_channel_id);
        info!("🎵 Reproduciendo: {}", pending.song);

        state.sink = Some(ActiveSink {
            id: sink_id,
            handle,
            song: pending.song,
        });
        Ok(())
    }

    /// Stops the old sink and marks the player Playing while the new stream
    /// resolves.
    fn begin_start(&self, state: &mut State, options: PlayOptions) -> PlayerResult<PendingStart> {
        let connection = state
            .session
            .as_ref()
            .map(|s| s.connection.clone())
            .ok_or(PlayerError::NotConnected)?;
        let current = state.queue.current().cloned().ok_or(PlayerError::QueueEnded)?;

        self.cancel_idle_timer(state);
        self.halt(state);

        let seek = options.seek.unwrap_or(0);
        let song = &current.song;
        let resolve_options = if song.offset > 0 {
            ResolveOptions {
                seek: Some(seek + song.offset),
                to: Some(song.length + song.offset),
            }
        } else {
            ResolveOptions {
                seek: options.seek,
                to: None,
            }
        };

        let token = CancellationToken::new();
        *self.inner.resolving.lock() = Some(token.clone());
        state.status = PlayerStatus::Playing;
        state.position.set(seek);

        Ok(PendingStart {
            generation: state.play_generation,
            connection,
            song: current,
            options: resolve_options,
            token,
        })
    }

    /// Settles the state after a start failed past `begin_start`.
    fn start_failed(&self, state: &mut State) {
        state.status = PlayerStatus::Idle;
        state.position.reset();
        self.schedule_idle_timer(state);
    }

    fn manual_forward_locked(&self, state: &mut State, skip: usize) -> ForwardOutcome {
        let outcome = state.queue.forward(skip);
        match outcome {
            ForwardOutcome::Advanced => {
                self.halt(state);
                state.position.reset();
            }
            ForwardOutcome::QueueEnded => {
                debug!("La cola no tiene {} canciones más", skip);
                self.notify(state.announce_channel, NotificationKind::QueueEnded);
            }
        }
        outcome
    }

    /// Moves forward and reports whether the new current song should start.
    fn advance_locked(&self, state: &mut State, skip: usize) -> (ForwardOutcome, bool) {
        let outcome = self.manual_forward_locked(state, skip);
        if outcome == ForwardOutcome::QueueEnded {
            return (outcome, false);
        }

        if state.queue.current().is_none() {
            self.queue_ran_out(state);
            return (outcome, false);
        }
        (outcome, self.should_autoplay(state))
    }

    /// Goes idle after the last song and starts the empty-queue timer.
    fn queue_ran_out(&self, state: &mut State) {
        self.halt(state);
        state.status = PlayerStatus::Idle;
        state.position.reset();
        info!("📭 Cola terminada en guild {}", self.inner.guild_id);
        self.notify(state.announce_channel, NotificationKind::QueueEnded);
        self.schedule_idle_timer(state);
    }

    fn should_autoplay(&self, state: &State) -> bool {
        state.session.is_some() && state.status != PlayerStatus::Paused
    }

    fn resume_position(&self, state: &State) -> Option<u64> {
        match state.queue.current() {
            Some(current) if !current.song.is_live => Some(state.position.get()),
            _ => None,
        }
    }

    fn set_volume_locked(&self, state: &mut State, level: u8) {
        let level = level.min(100);
        state.volume = Some(level);
        if let Some(sink) = &state.sink {
            sink.handle.set_volume(gain(level));
        }
        debug!("🔊 Volumen ajustado a {}%", level);
    }

    /// Stops the sink and any start still resolving. Playing drops to Idle;
    /// Paused stays Paused and replays on resume.
    fn halt(&self, state: &mut State) {
        self.cancel_resolve();
        state.play_generation += 1;
        if let Some(sink) = state.sink.take() {
            sink.handle.stop();
        }
        state.position.stop();
        if state.status == PlayerStatus::Playing {
            state.status = PlayerStatus::Idle;
        }
    }

    /// Drops the voice session. Playback that was running becomes paused at
    /// its current position, and a join still in flight is discarded.
    async fn teardown_session(&self, state: &mut State, leave: bool) {
        let was_playing = state.status == PlayerStatus::Playing;
        self.halt(state);
        if was_playing {
            state.status = PlayerStatus::Paused;
        }
        state.sessions_started += 1;

        if let Some(session) = state.session.take() {
            if leave {
                if let Err(e) = session.connection.leave().await {
                    warn!("⚠️ Error al salir del canal de voz: {}", e);
                }
            }
            debug!("Sesión de voz {} cerrada", session.id);
        }
    }

    fn cancel_resolve(&self) {
        if let Some(token) = self.inner.resolving.lock().take() {
            token.cancel();
        }
    }

    fn schedule_idle_timer(&self, state: &mut State) {
        self.cancel_idle_timer(state);

        let timeout = state.settings.empty_queue_timeout_secs;
        if timeout == 0 || state.session.is_none() {
            return;
        }

        let generation = state.timer_generation;
        let tx = self.inner.timeouts_tx.clone();
        state.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout)).await;
            let _ = tx.send(generation);
        }));
        debug!("⏲️ Desconexión en {}s si la cola sigue vacía", timeout);
    }

    fn cancel_idle_timer(&self, state: &mut State) {
        state.timer_generation += 1;
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
    }

    async fn load_settings(&self) -> GuildSettings {
        match self.inner.deps.settings.get(self.inner.guild_id).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("⚠️ No se pudo leer la configuración de {}: {}", self.inner.guild_id, e);
                GuildSettings::default()
            }
        }
    }

    fn notify(&self, channel_id: Option<ChannelId>, kind: NotificationKind) {
        let _ = self.inner.deps.notifications.send(PlayerNotification {
            guild_id: self.inner.guild_id,
            channel_id,
            kind,
        });
    }

    // ---- events ----

    async fn handle_event(&self, event: SessionEvent) -> Option<FollowUp> {
        let mut state = self.inner.state.lock().await;

        if state.session.as_ref().map(|s| s.id) != Some(event.session) {
            debug!("Evento de una sesión anterior ignorado: {:?}", event.event);
            return None;
        }

        match event.event {
            VoiceEvent::Ready => self.on_ready(&mut state).await,
            VoiceEvent::Disconnected => {
                warn!("🔌 Desconectado del canal de voz en guild {}", self.inner.guild_id);
                self.teardown_session(&mut state, true).await;
            }
            VoiceEvent::SpeakingStarted(user) | VoiceEvent::SpeakingStopped(user) => {
                let started = matches!(event.event, VoiceEvent::SpeakingStarted(_));
                self.on_speaking(&mut state, user, started);
            }
            VoiceEvent::SinkIdle(id) => return self.on_sink_end(&mut state, id, false),
            VoiceEvent::SinkFailed(id) => return self.on_sink_end(&mut state, id, true),
        }
        None
    }

    async fn on_ready(&self, state: &mut State) {
        state.settings = self.load_settings().await;
        let duck = state.settings.duck_enabled;

        if let Some(session) = state.session.as_mut() {
            session.listening = duck;
            if !duck {
                session.speech.clear();
            }
        }
        debug!("✅ Conexión lista (ducking: {})", duck);
    }

    fn on_speaking(&self, state: &mut State, user: UserId, started: bool) {
        let Some(session) = state.session.as_mut() else {
            return;
        };
        if !session.listening {
            return;
        }

        let channel_id = session.channel_id;
        if started {
            session.speech.speaking_started(channel_id, user);
        } else {
            session.speech.speaking_stopped(channel_id, user);
        }

        let target = session.speech.target_volume(
            channel_id,
            state.settings.duck_target,
            state.settings.default_volume,
        );
        if let Some(level) = target {
            self.set_volume_locked(state, level);
        }
    }

    fn on_sink_end(&self, state: &mut State, sink_id: SinkId, failed: bool) -> Option<FollowUp> {
        if state.sink.as_ref().map(|s| s.id) != Some(sink_id) {
            debug!("Fin de un sink reemplazado ({}) ignorado", sink_id);
            return None;
        }
        if state.status != PlayerStatus::Playing {
            return None;
        }

        state.sink = None;
        state.position.stop();

        if state.loop_song && !failed {
            return Some(FollowUp {
                options: PlayOptions { seek: Some(0) },
                announce: false,
            });
        }

        if state.loop_queue {
            if let Some(current) = state.queue.current().cloned() {
                state.queue.add(current, false);
            }
        }

        let (_, start) = self.advance_locked(state, 1);
        start.then_some(FollowUp {
            options: PlayOptions::default(),
            announce: state.settings.auto_announce_next_song,
        })
    }

    async fn run_follow_up(&self, follow_up: FollowUp) {
        match self.play_current(follow_up.options).await {
            Ok(()) => {}
            Err(PlayerError::Resolve(ResolveError::Cancelled)) => {
                debug!("Reproducción automática reemplazada");
            }
            Err(e) => error!("❌ Error al reproducir la siguiente canción: {}", e),
        }

        if follow_up.announce {
            let state = self.inner.state.lock().await;
            if state.status == PlayerStatus::Playing {
                if let Some(current) = state.queue.current().cloned() {
                    self.notify(
                        Some(current.added_in_channel_id),
                        NotificationKind::NowPlaying(current),
                    );
                }
            }
        }
    }

    async fn on_idle_timeout(&self, generation: u64) {
        let mut state = self.inner.state.lock().await;

        if generation != state.timer_generation || state.status != PlayerStatus::Idle {
            return;
        }
        state.idle_timer = None;

        if state.session.is_some() {
            info!("⏰ Cola vacía, saliendo del canal de voz en guild {}", self.inner.guild_id);
            self.teardown_session(&mut state, true).await;
        }
    }
}

fn is_unplayable(error: &PlayerError) -> bool {
    matches!(
        error,
        PlayerError::Resolve(ResolveError::NoSuitableFormat | ResolveError::Stream(_))
    )
}

async fn run_events(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut timeouts: mpsc::UnboundedReceiver<u64>,
) {
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                let Some(inner) = inner.upgrade() else { return };
                let player = GuildPlayer { inner };
                // follow-ups run outside the event loop
                if let Some(follow_up) = player.handle_event(event).await {
                    tokio::spawn(async move { player.run_follow_up(follow_up).await });
                }
            }
            Some(generation) = timeouts.recv() => {
                let Some(inner) = inner.upgrade() else { return };
                GuildPlayer { inner }.on_idle_timeout(generation).await;
            }
            else => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::formats::{MediaFormat, MediaInfo, MockFormatSource};
    use crate::audio::song::{Song, SourceType};
    use crate::audio::stream::{tests::output_of, DecodedStream};
    use crate::audio::transcoder::{
        AudioTranscoder, TranscodeOutput, TranscodeProcess, TranscodeRequest,
    };
    use crate::cache::FileCache;
    use crate::storage::MockGuildSettingsProvider;
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::AsyncWriteExt;

    // ---- fakes ----

    /// Inputs containing "unavailable" fail; inputs containing "slow" start
    /// but never produce a byte.
    #[derive(Default)]
    struct FakeTranscoder {
        requests: SyncMutex<Vec<TranscodeRequest>>,
        stalled: SyncMutex<Vec<tokio::io::DuplexStream>>,
        released: Arc<AtomicBool>,
    }

    impl FakeTranscoder {
        fn requests(&self) -> Vec<TranscodeRequest> {
            self.requests.lock().clone()
        }

        async fn wait_for_requests(&self, count: usize) {
            for _ in 0..200 {
                if self.requests.lock().len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("the transcoder never saw {count} requests");
        }

        /// Whether a stalled transcode was dropped.
        fn released(&self) -> bool {
            self.released.load(Ordering::SeqCst)
        }
    }

    struct StalledProcess(Arc<AtomicBool>);

    impl TranscodeProcess for StalledProcess {
        fn kill(&mut self) {}
    }

    impl Drop for StalledProcess {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AudioTranscoder for FakeTranscoder {
        async fn transcode(
            &self,
            request: TranscodeRequest,
        ) -> Result<TranscodeOutput, ResolveError> {
            self.requests.lock().push(request.clone());
            if request.input.contains("unavailable") {
                return Err(ResolveError::stream(anyhow::anyhow!("404")));
            }
            if request.input.contains("slow") {
                let (reader, writer) = tokio::io::duplex(64);
                self.stalled.lock().push(writer);
                return Ok(TranscodeOutput {
                    reader: Box::new(reader),
                    process: Box::new(StalledProcess(self.released.clone())),
                });
            }
            let (output, _) = output_of(std::io::Cursor::new(b"opus".to_vec()));
            Ok(output)
        }
    }

    #[derive(Default)]
    struct FakeSink {
        volume: SyncMutex<f32>,
        paused: AtomicBool,
        stopped: AtomicBool,
    }

    struct SinkRef(Arc<FakeSink>);

    impl SinkHandle for SinkRef {
        fn set_volume(&self, volume: f32) {
            *self.0.volume.lock() = volume;
        }
        fn pause(&self) {
            self.0.paused.store(true, Ordering::SeqCst);
        }
        fn resume(&self) {
            self.0.paused.store(false, Ordering::SeqCst);
        }
        fn stop(&self) {
            self.0.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeConnection {
        /// (sink id, initial gain, sink)
        plays: SyncMutex<Vec<(SinkId, f32, Arc<FakeSink>)>>,
        left: AtomicBool,
        /// Makes every later `play` fail.
        broken: AtomicBool,
    }

    #[async_trait]
    impl VoiceConnection for FakeConnection {
        async fn play(
            &self,
            _stream: DecodedStream,
            volume: f32,
            sink_id: SinkId,
        ) -> Result<Box<dyn SinkHandle>> {
            if self.broken.load(Ordering::SeqCst) {
                anyhow::bail!("driver gone");
            }
            let sink = Arc::new(FakeSink {
                volume: SyncMutex::new(volume),
                ..Default::default()
            });
            self.plays.lock().push((sink_id, volume, sink.clone()));
            Ok(Box::new(SinkRef(sink)))
        }

        async fn leave(&self) -> Result<()> {
            self.left.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeVoice {
        connection: Arc<FakeConnection>,
        events: SyncMutex<Option<EventSink>>,
    }

    #[async_trait]
    impl VoiceAdapter for FakeVoice {
        async fn join(
            &self,
            _guild_id: GuildId,
            _channel_id: ChannelId,
            events: EventSink,
        ) -> Result<Arc<dyn VoiceConnection>> {
            *self.events.lock() = Some(events);
            Ok(self.connection.clone())
        }
    }

    struct Harness {
        player: GuildPlayer,
        voice: Arc<FakeVoice>,
        transcoder: Arc<FakeTranscoder>,
        notifications: broadcast::Receiver<PlayerNotification>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn session(&self) -> u64 {
            self.voice.events.lock().as_ref().map(|e| e.session()).unwrap()
        }

        async fn send(&self, event: VoiceEvent) {
            let session = self.session();
            let follow_up = self
                .player
                .handle_event(SessionEvent { session, event })
                .await;
            if let Some(follow_up) = follow_up {
                self.player.run_follow_up(follow_up).await;
            }
        }

        fn plays(&self) -> Vec<(SinkId, f32, Arc<FakeSink>)> {
            self.voice.connection.plays.lock().clone()
        }

        fn last_sink(&self) -> (SinkId, Arc<FakeSink>) {
            let (id, _, sink) = self.plays().last().cloned().unwrap();
            (id, sink)
        }

        /// Ends the sink that is currently playing, as the driver would.
        async fn finish_song(&self) {
            let (id, _) = self.last_sink();
            self.send(VoiceEvent::SinkIdle(id)).await;
        }

        fn notifications(&mut self) -> Vec<NotificationKind> {
            std::iter::from_fn(|| self.notifications.try_recv().ok())
                .map(|n| n.kind)
                .collect()
        }
    }

    async fn harness(settings: GuildSettings) -> Harness {
        harness_with(settings, MockFormatSource::new()).await
    }

    async fn harness_with(settings: GuildSettings, formats: MockFormatSource) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::new(dir.path()).await.unwrap());
        let transcoder = Arc::new(FakeTranscoder::default());
        let resolver = StreamResolver::new(cache, transcoder.clone(), Arc::new(formats));

        let mut provider = MockGuildSettingsProvider::new();
        provider
            .expect_get()
            .returning(move |_| Ok(settings.clone()));

        let voice = Arc::new(FakeVoice::default());
        let (notifications, rx) = broadcast::channel(32);
        let player = GuildPlayer::new(
            GuildId::new(1),
            PlayerDeps {
                resolver: Arc::new(resolver),
                voice: voice.clone(),
                settings: Arc::new(provider),
                notifications,
            },
        );

        Harness {
            player,
            voice,
            transcoder,
            notifications: rx,
            _dir: dir,
        }
    }

    fn song(name: &str) -> QueuedSong {
        QueuedSong::new(
            Song::new(name, format!("https://radio.example/{name}.m3u8"), SourceType::Hls)
                .with_length(180),
            ChannelId::new(10),
            UserId::new(20),
        )
    }

    async fn connected_with(names: &[&str], settings: GuildSettings) -> Harness {
        let h = harness(settings).await;
        for name in names {
            h.player.add(song(name), false).await;
        }
        h.player.connect(ChannelId::new(5)).await.unwrap();
        h
    }

    async fn connected(names: &[&str]) -> Harness {
        connected_with(names, GuildSettings::default()).await
    }

    async fn current_title(player: &GuildPlayer) -> Option<String> {
        player.current().await.map(|s| s.title().to_string())
    }

    // ---- tests ----

    #[tokio::test]
    async fn play_requires_connection_and_song() {
        let h = harness(GuildSettings::default()).await;
        h.player.add(song("a"), false).await;
        assert!(matches!(
            h.player.play(PlayOptions::default()).await,
            Err(PlayerError::NotConnected)
        ));

        let h = connected(&[]).await;
        assert!(matches!(
            h.player.play(PlayOptions::default()).await,
            Err(PlayerError::QueueEnded)
        ));
    }

    #[tokio::test]
    async fn play_starts_sink_and_tracks_position() {
        let h = connected(&["a"]).await;

        h.player.play(PlayOptions { seek: Some(42) }).await.unwrap();

        assert_eq!(h.player.status().await, PlayerStatus::Playing);
        assert_eq!(h.player.position().await, 42);
        assert_eq!(h.plays().len(), 1);
        assert_eq!(h.plays()[0].1, 1.0);
    }

    #[tokio::test]
    async fn new_stream_stops_previous_one() {
        let h = connected(&["a"]).await;
        h.player.play(PlayOptions::default()).await.unwrap();
        let (_, first) = h.last_sink();

        h.player.seek(30).await.unwrap();

        assert!(first.stopped.load(Ordering::SeqCst));
        assert_eq!(h.plays().len(), 2);
        assert_eq!(h.player.position().await, 30);
    }

    #[tokio::test]
    async fn seek_beyond_song_is_rejected() {
        let h = connected(&["a"]).await;
        h.player.play(PlayOptions::default()).await.unwrap();

        assert!(matches!(h.player.seek(181).await, Err(PlayerError::SeekOutOfRange)));
        assert_eq!(h.plays().len(), 1);
    }

    #[tokio::test]
    async fn forward_through_the_queue() {
        let mut h = connected(&["a", "b", "c"]).await;
        h.player.play(PlayOptions::default()).await.unwrap();

        assert_eq!(h.player.forward(1).await.unwrap(), ForwardOutcome::Advanced);
        assert_eq!(current_title(&h.player).await.as_deref(), Some("b"));
        assert_eq!(h.player.queue_size().await, 1);

        assert_eq!(h.player.forward(2).await.unwrap(), ForwardOutcome::Advanced);
        assert_eq!(h.player.current().await, None);
        assert_eq!(h.player.status().await, PlayerStatus::Idle);
        assert_eq!(h.notifications(), vec![NotificationKind::QueueEnded]);

        assert_eq!(h.player.forward(1).await.unwrap(), ForwardOutcome::QueueEnded);
        assert_eq!(h.notifications(), vec![NotificationKind::QueueEnded]);
    }

    #[tokio::test]
    async fn back_replays_previous_song() {
        let h = connected(&["a", "b"]).await;
        assert!(matches!(h.player.back().await, Err(PlayerError::NoPreviousSong)));

        h.player.play(PlayOptions::default()).await.unwrap();
        h.player.forward(1).await.unwrap();
        h.player.back().await.unwrap();

        assert_eq!(current_title(&h.player).await.as_deref(), Some("a"));
        assert_eq!(h.player.status().await, PlayerStatus::Playing);
        assert_eq!(h.plays().len(), 3);
    }

    #[tokio::test]
    async fn natural_end_advances() {
        let h = connected(&["a", "b"]).await;
        h.player.play(PlayOptions::default()).await.unwrap();

        h.finish_song().await;

        assert_eq!(current_title(&h.player).await.as_deref(), Some("b"));
        assert_eq!(h.player.status().await, PlayerStatus::Playing);

        h.finish_song().await;
        assert_eq!(h.player.status().await, PlayerStatus::Idle);
        assert_eq!(h.player.current().await, None);
    }

    #[tokio::test]
    async fn stale_sink_end_is_ignored() {
        let h = connected(&["a", "b"]).await;
        h.player.play(PlayOptions::default()).await.unwrap();
        let (stale, _) = h.last_sink();
        h.player.seek(10).await.unwrap();

        h.send(VoiceEvent::SinkIdle(stale)).await;

        assert_eq!(current_title(&h.player).await.as_deref(), Some("a"));
        assert_eq!(h.plays().len(), 2);
    }

    #[tokio::test]
    async fn loop_song_replays_from_start() {
        let h = connected(&["a", "b"]).await;
        h.player.set_loop_song(true).await;
        h.player.play(PlayOptions { seek: Some(50) }).await.unwrap();

        h.finish_song().await;

        assert_eq!(current_title(&h.player).await.as_deref(), Some("a"));
        assert_eq!(h.player.position().await, 0);
        assert_eq!(h.player.status().await, PlayerStatus::Playing);
        assert_eq!(h.plays().len(), 2);
    }

    #[tokio::test]
    async fn sink_failure_skips_even_with_loop_song() {
        let h = connected(&["a", "b"]).await;
        h.player.set_loop_song(true).await;
        h.player.play(PlayOptions::default()).await.unwrap();

        let (id, _) = h.last_sink();
        h.send(VoiceEvent::SinkFailed(id)).await;

        assert_eq!(current_title(&h.player).await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn loop_queue_appends_finished_song() {
        let h = connected(&["a", "b"]).await;
        h.player.set_loop_queue(true).await;
        h.player.play(PlayOptions::default()).await.unwrap();

        h.finish_song().await;

        assert_eq!(current_title(&h.player).await.as_deref(), Some("b"));
        let upcoming: Vec<String> = h
            .player
            .upcoming()
            .await
            .iter()
            .map(|s| s.title().to_string())
            .collect();
        assert_eq!(upcoming, vec!["a"]);
    }

    #[tokio::test]
    async fn loop_flags_are_exclusive_and_survive_stop() {
        let h = connected(&["a"]).await;

        h.player.set_loop_song(true).await;
        h.player.set_loop_queue(true).await;
        assert!(!h.player.loop_song().await);
        assert!(h.player.loop_queue().await);

        assert!(h.player.toggle_loop_song().await);
        assert!(!h.player.loop_queue().await);

        h.player.stop().await;

        assert!(h.player.loop_song().await);
        assert_eq!(h.player.status().await, PlayerStatus::Idle);
        assert!(h.player.current().await.is_none());
        assert!(h.voice.connection.left.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn pause_and_resume_keep_the_sink() {
        let h = connected(&["a"]).await;
        assert!(matches!(h.player.pause().await, Err(PlayerError::NotPlaying)));
        assert!(matches!(h.player.resume().await, Err(PlayerError::NotPaused)));

        h.player.play(PlayOptions { seek: Some(20) }).await.unwrap();
        h.player.pause().await.unwrap();
        let (_, sink) = h.last_sink();

        assert_eq!(h.player.status().await, PlayerStatus::Paused);
        assert!(sink.paused.load(Ordering::SeqCst));

        h.player.resume().await.unwrap();
        assert_eq!(h.player.status().await, PlayerStatus::Playing);
        assert!(!sink.paused.load(Ordering::SeqCst));
        assert_eq!(h.plays().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_pauses_and_resume_replays_at_position() {
        let h = connected(&["a"]).await;
        h.player.play(PlayOptions { seek: Some(60) }).await.unwrap();

        h.send(VoiceEvent::Disconnected).await;
        assert_eq!(h.player.status().await, PlayerStatus::Paused);
        assert_eq!(h.player.channel_id().await, None);

        h.player.connect(ChannelId::new(5)).await.unwrap();
        h.player.resume().await.unwrap();

        assert_eq!(h.player.status().await, PlayerStatus::Playing);
        assert_eq!(h.plays().len(), 2);
        assert!(h.player.position().await >= 60);
    }

    #[tokio::test]
    async fn events_from_old_sessions_are_dropped() {
        let h = connected(&["a"]).await;
        let old = h.session();
        h.player.connect(ChannelId::new(6)).await.unwrap();
        h.player.play(PlayOptions::default()).await.unwrap();

        let follow_up = h
            .player
            .handle_event(SessionEvent {
                session: old,
                event: VoiceEvent::Disconnected,
            })
            .await;

        assert!(follow_up.is_none());
        assert_eq!(h.player.channel_id().await, Some(ChannelId::new(6)));
        assert_eq!(h.player.status().await, PlayerStatus::Playing);
    }

    #[tokio::test]
    async fn manual_volume_while_ducked_is_replaced_by_the_default() {
        let settings = GuildSettings {
            duck_enabled: true,
            duck_target: Some(20),
            default_volume: 80,
            ..Default::default()
        };
        let h = connected_with(&["a"], settings).await;
        h.send(VoiceEvent::Ready).await;
        h.player.play(PlayOptions::default()).await.unwrap();
        let (_, sink) = h.last_sink();

        h.send(VoiceEvent::SpeakingStarted(UserId::new(7))).await;
        h.player.set_volume(50).await;
        assert_eq!(*sink.volume.lock(), 0.5);

        h.send(VoiceEvent::SpeakingStopped(UserId::new(7))).await;

        assert_eq!(h.player.volume().await, 80);
        assert_eq!(*sink.volume.lock(), 0.8);
    }

    #[tokio::test]
    async fn ducks_while_members_speak() {
        let settings = GuildSettings {
            duck_enabled: true,
            duck_target: Some(20),
            default_volume: 80,
            ..Default::default()
        };
        let h = connected_with(&["a"], settings).await;
        h.send(VoiceEvent::Ready).await;
        h.player.play(PlayOptions::default()).await.unwrap();
        let (_, sink) = h.last_sink();
        assert_eq!(*sink.volume.lock(), 0.8);

        h.send(VoiceEvent::SpeakingStarted(UserId::new(7))).await;
        assert_eq!(h.player.volume().await, 20);
        assert_eq!(*sink.volume.lock(), 0.2);

        h.send(VoiceEvent::SpeakingStopped(UserId::new(7))).await;
        assert_eq!(h.player.volume().await, 80);
        assert_eq!(*sink.volume.lock(), 0.8);
    }

    #[tokio::test]
    async fn speaking_is_ignored_without_ducking() {
        let h = connected(&["a"]).await;
        h.send(VoiceEvent::Ready).await;
        h.player.set_volume(50).await;

        h.send(VoiceEvent::SpeakingStarted(UserId::new(7))).await;

        assert_eq!(h.player.volume().await, 50);
    }

    #[tokio::test]
    async fn volume_falls_back_to_guild_default_and_clamps() {
        let settings = GuildSettings {
            default_volume: 65,
            ..Default::default()
        };
        let h = connected_with(&["a"], settings).await;
        assert_eq!(h.player.volume().await, 65);

        h.player.set_volume(150).await;
        assert_eq!(h.player.volume().await, 100);
    }

    #[tokio::test]
    async fn unavailable_song_is_skipped_and_error_returned() {
        let mut h = connected(&["unavailable", "b"]).await;

        let result = h.player.play(PlayOptions::default()).await;

        assert!(matches!(
            result,
            Err(PlayerError::Resolve(ResolveError::Stream(_)))
        ));
        assert_eq!(current_title(&h.player).await.as_deref(), Some("b"));
        assert_eq!(h.player.status().await, PlayerStatus::Playing);
        assert!(matches!(
            h.notifications().as_slice(),
            [NotificationKind::SongUnavailable { .. }]
        ));
    }

    #[tokio::test]
    async fn auto_announce_after_natural_advance() {
        let settings = GuildSettings {
            auto_announce_next_song: true,
            ..Default::default()
        };
        let mut h = connected_with(&["a", "b"], settings).await;
        h.player.play(PlayOptions::default()).await.unwrap();

        h.finish_song().await;

        assert_eq!(
            h.notifications(),
            vec![NotificationKind::NowPlaying(song_like(&h.player).await)]
        );
    }

    async fn song_like(player: &GuildPlayer) -> QueuedSong {
        player.current().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_leaves_after_timeout() {
        let settings = GuildSettings {
            empty_queue_timeout_secs: 30,
            ..Default::default()
        };
        let h = connected_with(&["a"], settings).await;
        h.player.play(PlayOptions::default()).await.unwrap();

        h.finish_song().await;
        assert_eq!(h.player.status().await, PlayerStatus::Idle);
        assert!(h.player.channel_id().await.is_some());

        tokio::time::sleep(Duration::from_secs(31)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(h.player.channel_id().await, None);
        assert!(h.voice.connection.left.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn playing_again_cancels_the_timeout() {
        let h = connected(&["a"]).await;
        h.player.play(PlayOptions::default()).await.unwrap();
        h.finish_song().await;

        h.player.add(song("b"), false).await;
        h.player.play(PlayOptions::default()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(h.player.channel_id().await, Some(ChannelId::new(5)));
        assert_eq!(current_title(&h.player).await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn stop_cancels_in_flight_resolve() {
        let h = connected(&["a"]).await;
        let token = CancellationToken::new();
        *h.player.inner.resolving.lock() = Some(token.clone());

        h.player.stop().await;

        assert!(token.is_cancelled());
        assert!(h.player.inner.resolving.lock().is_none());
    }

    #[tokio::test]
    async fn failed_sink_start_leaves_player_idle() {
        let h = connected(&["a"]).await;
        h.player.play(PlayOptions::default()).await.unwrap();
        let (_, old) = h.last_sink();
        h.voice.connection.broken.store(true, Ordering::SeqCst);

        let result = h.player.seek(10).await;

        assert!(matches!(result, Err(PlayerError::Connection(_))));
        assert!(old.stopped.load(Ordering::SeqCst));
        assert_eq!(h.player.status().await, PlayerStatus::Idle);
        assert_eq!(h.player.position().await, 0);
        assert!(matches!(h.player.pause().await, Err(PlayerError::NotPlaying)));

        // the song is still there to retry once the driver is back
        h.voice.connection.broken.store(false, Ordering::SeqCst);
        h.player.play(PlayOptions::default()).await.unwrap();
        assert_eq!(h.player.status().await, PlayerStatus::Playing);
    }

    #[tokio::test]
    async fn commands_answer_while_a_song_is_loading() {
        let h = connected(&["slow", "b"]).await;
        let player = h.player.clone();
        let loading = tokio::spawn(async move { player.play(PlayOptions::default()).await });
        h.transcoder.wait_for_requests(1).await;

        let size = tokio::time::timeout(Duration::from_millis(500), h.player.queue_size()).await;
        assert_eq!(size.ok(), Some(1));
        let status = tokio::time::timeout(Duration::from_millis(500), h.player.status()).await;
        assert_eq!(status.ok(), Some(PlayerStatus::Playing));
        h.player.add(song("c"), false).await;
        h.player.set_volume(30).await;

        h.player.stop().await;

        assert!(matches!(
            loading.await.unwrap(),
            Err(PlayerError::Resolve(ResolveError::Cancelled))
        ));
        assert!(h.transcoder.released());
        assert_eq!(h.player.status().await, PlayerStatus::Idle);
        assert!(h.plays().is_empty());
    }

    #[tokio::test]
    async fn forward_overtakes_a_loading_song() {
        let h = connected(&["slow", "b"]).await;
        let player = h.player.clone();
        let loading = tokio::spawn(async move { player.play(PlayOptions::default()).await });
        h.transcoder.wait_for_requests(1).await;

        assert_eq!(h.player.forward(1).await.unwrap(), ForwardOutcome::Advanced);

        assert!(matches!(
            loading.await.unwrap(),
            Err(PlayerError::Resolve(ResolveError::Cancelled))
        ));
        assert!(h.transcoder.released());
        assert_eq!(current_title(&h.player).await.as_deref(), Some("b"));
        assert_eq!(h.player.status().await, PlayerStatus::Playing);
        assert_eq!(h.plays().len(), 1);
    }

    #[tokio::test]
    async fn pause_while_loading_starts_the_sink_paused() {
        let h = connected(&["slow"]).await;
        let player = h.player.clone();
        let loading = tokio::spawn(async move { player.play(PlayOptions { seek: Some(12) }).await });
        h.transcoder.wait_for_requests(1).await;

        h.player.pause().await.unwrap();
        let mut writer = h.transcoder.stalled.lock().pop().unwrap();
        writer.write_all(b"opus").await.unwrap();
        loading.await.unwrap().unwrap();

        let (_, sink) = h.last_sink();
        assert!(sink.paused.load(Ordering::SeqCst));
        assert_eq!(h.player.status().await, PlayerStatus::Paused);
        assert_eq!(h.player.position().await, 12);

        h.player.resume().await.unwrap();
        assert!(!sink.paused.load(Ordering::SeqCst));
        assert_eq!(h.plays().len(), 1);
    }

    #[tokio::test]
    async fn song_offset_shifts_the_transcoded_window() {
        let mut formats = MockFormatSource::new();
        formats.expect_probe().times(2).returning(|_| {
            Ok(MediaInfo {
                formats: vec![MediaFormat {
                    url: "https://cdn.example/251".into(),
                    itag: Some(251),
                    codec: Some("opus".into()),
                    container: Some("webm".into()),
                    audio_sample_rate: Some(48_000),
                    ..Default::default()
                }],
                is_live: false,
                duration: 600,
            })
        });
        let h = harness_with(GuildSettings::default(), formats).await;
        let chapter = Song::new("chapter", "https://www.youtube.com/watch?v=mix", SourceType::YouTube)
            .with_length(120)
            .with_offset(30);
        h.player
            .add(QueuedSong::new(chapter, ChannelId::new(10), UserId::new(20)), false)
            .await;
        h.player.connect(ChannelId::new(5)).await.unwrap();

        h.player.play(PlayOptions::default()).await.unwrap();
        h.player.seek(10).await.unwrap();

        let windows: Vec<(Option<u64>, Option<u64>)> = h
            .transcoder
            .requests()
            .iter()
            .map(|r| (r.options.seek, r.options.to))
            .collect();
        assert_eq!(windows, vec![(Some(30), Some(150)), (Some(40), Some(150))]);
        // the position stays relative to the song
        assert_eq!(h.player.position().await, 10);
    }

    #[tokio::test]
    async fn disconnect_keeps_queue_and_loop_flags() {
        let h = connected(&["a", "b"]).await;
        h.player.set_loop_queue(true).await;
        h.player.play(PlayOptions { seek: Some(15) }).await.unwrap();
        let (_, sink) = h.last_sink();

        h.player.disconnect().await;

        assert_eq!(h.player.status().await, PlayerStatus::Paused);
        assert_eq!(h.player.channel_id().await, None);
        assert!(h.voice.connection.left.load(Ordering::SeqCst));
        assert!(sink.stopped.load(Ordering::SeqCst));
        assert_eq!(current_title(&h.player).await.as_deref(), Some("a"));
        assert_eq!(h.player.queue_size().await, 1);
        assert!(h.player.loop_queue().await);
        assert!(h.player.position().await >= 15);

        h.player.connect(ChannelId::new(5)).await.unwrap();
        h.player.resume().await.unwrap();
        assert_eq!(h.player.status().await, PlayerStatus::Playing);
        assert_eq!(h.plays().len(), 2);
    }

    #[tokio::test]
    async fn removing_the_playing_song_starts_the_next() {
        let h = connected(&["a", "b", "c"]).await;
        h.player.play(PlayOptions::default()).await.unwrap();
        let (old_id, old) = h.last_sink();

        let removed = h.player.remove_current().await.unwrap();

        assert_eq!(removed.map(|s| s.title().to_string()).as_deref(), Some("a"));
        assert!(old.stopped.load(Ordering::SeqCst));
        assert_eq!(current_title(&h.player).await.as_deref(), Some("b"));
        assert_eq!(h.player.status().await, PlayerStatus::Playing);
        assert_eq!(h.plays().len(), 2);

        // the removed song's sink ending later must not skip "b"
        h.send(VoiceEvent::SinkIdle(old_id)).await;
        assert_eq!(current_title(&h.player).await.as_deref(), Some("b"));
        assert_eq!(h.player.queue_size().await, 1);
    }

    #[tokio::test]
    async fn removing_the_last_playing_song_ends_the_queue() {
        let mut h = connected(&["a"]).await;
        h.player.play(PlayOptions::default()).await.unwrap();

        h.player.remove_current().await.unwrap();

        assert_eq!(h.player.status().await, PlayerStatus::Idle);
        assert!(h.player.current().await.is_none());
        assert_eq!(h.notifications(), vec![NotificationKind::QueueEnded]);
    }
}
