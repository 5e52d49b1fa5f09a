use thiserror::Error;

/// Failures while turning a queued song into a playable stream.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("can't find a suitable format")]
    NoSuitableFormat,

    #[error("audio stream failed: {0}")]
    Stream(#[source] anyhow::Error),

    #[error("stream resolution was cancelled")]
    Cancelled,
}

impl ResolveError {
    pub fn stream(error: impl Into<anyhow::Error>) -> Self {
        Self::Stream(error.into())
    }
}

/// Errors reported by [`GuildPlayer`](crate::audio::player::GuildPlayer) operations.
///
/// The first group are user-facing conditions; none of them leave the player
/// in an inconsistent state.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("no songs in queue to go back to")]
    NoPreviousSong,

    #[error("the queue has ended")]
    QueueEnded,

    #[error("move index is outside the range of the queue")]
    InvalidMoveRange,

    #[error("remove range is outside the range of the queue")]
    InvalidRemoveRange,

    #[error("seek position is outside the range of the song")]
    SeekOutOfRange,

    #[error("not currently playing")]
    NotPlaying,

    #[error("playback is not paused")]
    NotPaused,

    #[error("not connected to a voice channel")]
    NotConnected,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("voice connection failed: {0}")]
    Connection(#[source] anyhow::Error),
}

impl PlayerError {
    /// Whether the error is a condition to report back to the user rather
    /// than a playback failure.
    pub fn is_user_action(&self) -> bool {
        matches!(
            self,
            PlayerError::NoPreviousSong
                | PlayerError::QueueEnded
                | PlayerError::InvalidMoveRange
                | PlayerError::InvalidRemoveRange
                | PlayerError::SeekOutOfRange
                | PlayerError::NotPlaying
                | PlayerError::NotPaused
                | PlayerError::NotConnected
        )
    }
}

pub type PlayerResult<T> = Result<T, PlayerError>;
