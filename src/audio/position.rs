use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Elapsed-seconds counter driven by a one second tick.
///
/// The tick task only exists while the player is Playing; `stop` aborts it
/// and keeps the last value.
#[derive(Debug, Default)]
pub struct PositionTracker {
    seconds: Arc<AtomicU64>,
    ticker: Option<JoinHandle<()>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts ticking, optionally resetting the counter first.
    pub fn start(&mut self, initial: Option<u64>) {
        self.stop();
        if let Some(initial) = initial {
            self.seconds.store(initial, Ordering::Relaxed);
        }

        let seconds = self.seconds.clone();
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                seconds.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }

    pub fn reset(&mut self) {
        self.set(0);
    }

    /// Stops ticking and holds the counter at `seconds`.
    pub fn set(&mut self, seconds: u64) {
        self.stop();
        self.seconds.store(seconds, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.seconds.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }
}

impl Drop for PositionTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn counts_seconds_while_running() {
        let mut tracker = PositionTracker::new();
        tracker.start(Some(10));

        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert_eq!(tracker.get(), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_freezes_position() {
        let mut tracker = PositionTracker::new();
        tracker.start(Some(0));
        tokio::time::sleep(Duration::from_millis(2500)).await;

        tracker.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(tracker.get(), 2);
        assert!(!tracker.is_running());

        // resuming without an initial value keeps counting from there
        tracker.start(None);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(tracker.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_the_running_count() {
        let mut tracker = PositionTracker::new();
        tracker.start(Some(0));
        tokio::time::sleep(Duration::from_millis(2999)).await;

        // the old ticker is due right now and must not land on the new value
        tracker.start(Some(40));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(tracker.get(), 40);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(tracker.get(), 41);

        tracker.set(7);
        assert!(!tracker.is_running());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(tracker.get(), 7);
    }
}
