use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a coaching session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Unique session identifier (e.g., "coach-2025-10-28-legday")
    pub session_id: String,

    /// Time allowed for the transport handshake
    pub handshake_timeout_ms: u64,

    /// Time allowed between sending setup and its acknowledgement
    pub setup_timeout_ms: u64,

    /// Consecutive failures before the session gives up
    pub max_reconnect_attempts: u32,

    /// First reconnect delay; doubles per consecutive failure
    pub backoff_base_ms: u64,

    pub backoff_max_ms: u64,

    /// Outbound messages held while the session is not yet active
    pub pending_limit: usize,

    pub barge_in: BargeInConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: format!("coach-{}", uuid::Uuid::new_v4()),
            handshake_timeout_ms: 5000,
            setup_timeout_ms: 5000,
            max_reconnect_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8000,
            pending_limit: 32,
            barge_in: BargeInConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    /// Delay before reconnect attempt `failures` (1-based): base * 2^(n-1), capped
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Thresholds for interrupting the coach when the user starts talking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// Normalized speech level that counts as talking
    pub threshold: f32,
    /// How long speech must be sustained before cancelling
    pub min_duration_ms: u64,
    /// Minimum gap between two cancels
    pub cooldown_ms: u64,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            min_duration_ms: 200,
            cooldown_ms: 1000,
        }
    }
}
