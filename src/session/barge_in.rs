use std::time::Duration;
use tokio::time::Instant;

use super::config::BargeInConfig;

/// Decides when user speech should interrupt the coach's reply
#[derive(Debug)]
pub struct BargeInDetector {
    threshold: f32,
    min_duration: Duration,
    cooldown: Duration,
    speech_started: Option<Instant>,
    last_fired: Option<Instant>,
}

impl BargeInDetector {
    pub fn new(config: &BargeInConfig) -> Self {
        Self {
            threshold: config.threshold,
            min_duration: Duration::from_millis(config.min_duration_ms),
            cooldown: Duration::from_millis(config.cooldown_ms),
            speech_started: None,
            last_fired: None,
        }
    }

    /// Feed one speech level reading. Returns true when a cancel should be sent.
    pub fn observe(&mut self, level: f32, now: Instant, reply_in_progress: bool) -> bool {
        if !reply_in_progress || level < self.threshold {
            self.speech_started = None;
            return false;
        }

        let started = *self.speech_started.get_or_insert(now);
        if now.saturating_duration_since(started) < self.min_duration {
            return false;
        }

        if let Some(last) = self.last_fired {
            if now.saturating_duration_since(last) < self.cooldown {
                return false;
            }
        }

        self.last_fired = Some(now);
        self.speech_started = None;
        true
    }

    pub fn reset(&mut self) {
        self.speech_started = None;
        self.last_fired = None;
    }
}
