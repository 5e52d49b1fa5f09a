use rand::seq::SliceRandom;
use std::time::Duration;
use tracing::{debug, info};

use crate::audio::song::QueuedSong;
use crate::error::{PlayerError, PlayerResult};

/// Result of trying to move the cursor forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Advanced,
    QueueEnded,
}

/// Ordered song list with a cursor.
///
/// Entries at or before the cursor are history and the current song; entries
/// after it are upcoming. The cursor may sit at `len()`, in which case there
/// is no current song.
#[derive(Debug, Default, Clone)]
pub struct MusicQueue {
    items: Vec<QueuedSong>,
    position: usize,
}

impl MusicQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a song. `immediate` queues it right after the current song,
    /// except for playlist entries which always go to the end to keep the
    /// playlist in order.
    pub fn add(&mut self, song: QueuedSong, immediate: bool) {
        if song.song.playlist.is_some() || !immediate {
            info!("➕ Agregado a la cola: {}", song.title());
            self.items.push(song);
        } else {
            let insert_at = (self.position + 1).min(self.items.len());
            info!("⏭️ Siguiente en la cola: {}", song.title());
            self.items.insert(insert_at, song);
        }
    }

    pub fn current(&self) -> Option<&QueuedSong> {
        self.items.get(self.position)
    }

    /// Upcoming songs, not including the current one.
    pub fn upcoming(&self) -> &[QueuedSong] {
        let start = (self.position + 1).min(self.items.len());
        &self.items[start..]
    }

    pub fn size(&self) -> usize {
        self.upcoming().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Randomly reorders the upcoming songs only.
    pub fn shuffle(&mut self) {
        let start = (self.position + 1).min(self.items.len());
        let mut rng = rand::thread_rng();
        self.items[start..].shuffle(&mut rng);
        info!("🔀 Cola mezclada ({} canciones)", self.items.len() - start);
    }

    /// Drops every song except the current one.
    pub fn clear(&mut self) {
        let current = self.current().cloned();
        self.items = current.into_iter().collect();
        self.position = 0;
        info!("🗑️ Cola limpiada");
    }

    /// Removes `amount` upcoming songs starting at `index` (1 = next song).
    ///
    /// Requests that are empty or reach past the end are rejected and the
    /// queue is left as it was.
    pub fn remove(&mut self, index: usize, amount: usize) -> PlayerResult<()> {
        let size = self.size();
        if index == 0 || amount == 0 || index > size || amount > size - index + 1 {
            return Err(PlayerError::InvalidRemoveRange);
        }

        let start = self.position + index;
        self.items.drain(start..start + amount);
        debug!("❌ Eliminadas {} canciones desde la posición {}", amount, index);
        Ok(())
    }

    /// Removes the current song; the next one takes its slot.
    pub fn remove_current(&mut self) -> Option<QueuedSong> {
        if self.position < self.items.len() {
            Some(self.items.remove(self.position))
        } else {
            None
        }
    }

    /// Moves an upcoming song from `from` to `to` (both relative to the
    /// cursor, 1 = next song) and returns it.
    pub fn move_song(&mut self, from: usize, to: usize) -> PlayerResult<&QueuedSong> {
        let size = self.size();
        if from == 0 || to == 0 || from > size || to > size {
            return Err(PlayerError::InvalidMoveRange);
        }

        let song = self.items.remove(self.position + from);
        self.items.insert(self.position + to, song);
        debug!("📍 Canción movida de posición {} a {}", from, to);

        Ok(&self.items[self.position + to])
    }

    pub fn can_go_forward(&self, skip: usize) -> bool {
        skip > 0 && skip <= self.items.len().saturating_sub(self.position)
    }

    pub fn forward(&mut self, skip: usize) -> ForwardOutcome {
        if self.can_go_forward(skip) {
            self.position += skip;
            ForwardOutcome::Advanced
        } else {
            ForwardOutcome::QueueEnded
        }
    }

    pub fn can_go_back(&self) -> bool {
        self.position > 0
    }

    pub fn back(&mut self) -> PlayerResult<()> {
        if !self.can_go_back() {
            return Err(PlayerError::NoPreviousSong);
        }
        self.position -= 1;
        Ok(())
    }

    /// Empties the queue entirely.
    pub fn reset(&mut self) {
        self.items.clear();
        self.position = 0;
    }

    pub fn total_duration(&self) -> Duration {
        self.upcoming()
            .iter()
            .chain(self.current())
            .filter(|item| !item.song.is_live)
            .map(|item| item.song.duration())
            .sum()
    }

    pub fn songs(&self) -> &[QueuedSong] {
        &self.items
    }
}
