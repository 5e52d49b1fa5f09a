use serenity::model::id::{ChannelId, UserId};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Tracks who is speaking in each voice channel and decides the ducked
/// volume.
#[derive(Debug, Default)]
pub struct SpeechActivityMonitor {
    speaking: HashMap<ChannelId, HashSet<UserId>>,
}

impl SpeechActivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn speaking_started(&mut self, channel_id: ChannelId, user_id: UserId) {
        self.speaking.entry(channel_id).or_default().insert(user_id);
        debug!("🗣️ {} empezó a hablar en {}", user_id, channel_id);
    }

    pub fn speaking_stopped(&mut self, channel_id: ChannelId, user_id: UserId) {
        self.speaking.entry(channel_id).or_default().remove(&user_id);
        debug!("🤐 {} dejó de hablar en {}", user_id, channel_id);
    }

    pub fn speakers(&self, channel_id: ChannelId) -> usize {
        self.speaking.get(&channel_id).map_or(0, HashSet::len)
    }

    /// Volume the player should switch to for `channel_id`.
    ///
    /// Returns `None` when no duck target is configured. Once nobody is
    /// speaking the guild default is restored, not whatever level was set
    /// by hand before or during the duck.
    pub fn target_volume(
        &self,
        channel_id: ChannelId,
        duck_target: Option<u8>,
        default_volume: u8,
    ) -> Option<u8> {
        let duck_target = duck_target?;
        if self.speakers(channel_id) > 0 {
            Some(duck_target)
        } else {
            Some(default_volume)
        }
    }

    pub fn clear(&mut self) {
        self.speaking.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn channel() -> ChannelId {
        ChannelId::new(7)
    }

    #[test]
    fn ducks_while_anyone_speaks() {
        let mut monitor = SpeechActivityMonitor::new();
        monitor.speaking_started(channel(), UserId::new(1));
        monitor.speaking_started(channel(), UserId::new(2));
        assert_eq!(monitor.target_volume(channel(), Some(20), 80), Some(20));

        monitor.speaking_stopped(channel(), UserId::new(1));
        assert_eq!(monitor.target_volume(channel(), Some(20), 80), Some(20));

        monitor.speaking_stopped(channel(), UserId::new(2));
        assert_eq!(monitor.target_volume(channel(), Some(20), 80), Some(80));
    }

    #[test]
    fn other_channels_do_not_duck() {
        let mut monitor = SpeechActivityMonitor::new();
        monitor.speaking_started(ChannelId::new(99), UserId::new(1));
        assert_eq!(monitor.target_volume(channel(), Some(20), 80), Some(80));
    }

    #[test]
    fn no_target_means_no_decision() {
        let mut monitor = SpeechActivityMonitor::new();
        monitor.speaking_started(channel(), UserId::new(1));
        assert_eq!(monitor.target_volume(channel(), None, 80), None);
    }

    #[test]
    fn stopping_unknown_speaker_is_harmless() {
        let mut monitor = SpeechActivityMonitor::new();
        monitor.speaking_stopped(channel(), UserId::new(5));
        assert_eq!(monitor.speakers(channel()), 0);
    }
}
