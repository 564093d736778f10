//! Rolling counters for throughput, latency and per-modality sample flow
//!
//! Every counter is an atomic so the capture path, the modality workers and
//! the session task can record without coordinating. Latency is an
//! exponentially weighted moving average written only by the owning
//! modality worker.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::modality::Modality;

/// Weight of the newest latency sample, as 1/N
const EWMA_WEIGHT: u64 = 8;

#[derive(Debug, Default)]
struct ModalityCounters {
    submitted: AtomicU64,
    admitted: AtomicU64,
    redacted: AtomicU64,
    dropped_by_policy: AtomicU64,
    dropped_by_backpressure: AtomicU64,
    throttled: AtomicU64,
    analyzer_failures: AtomicU64,
    published: AtomicU64,
    latency_ewma_us: AtomicU64,
}

/// Aggregates counters for one engine instance
#[derive(Debug)]
pub struct MetricsAggregator {
    started_at: Instant,
    started_wall: DateTime<Utc>,
    modalities: [ModalityCounters; 3],
    latency_budgets: [Duration; 3],
    insights_emitted: AtomicU64,
    messages_sent: AtomicU64,
    malformed_inbound: AtomicU64,
    reconnect_attempts: AtomicU64,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new([Duration::ZERO; 3])
    }
}

impl MetricsAggregator {
    /// `latency_budgets` is indexed pose, audio, vision; zero disables throttling
    pub fn new(latency_budgets: [Duration; 3]) -> Self {
        Self {
            started_at: Instant::now(),
            started_wall: Utc::now(),
            modalities: Default::default(),
            latency_budgets,
            insights_emitted: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            malformed_inbound: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
        }
    }

    fn counters(&self, modality: Modality) -> &ModalityCounters {
        &self.modalities[modality.index()]
    }

    pub fn record_submitted(&self, modality: Modality) {
        self.counters(modality).submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admitted(&self, modality: Modality, redacted: bool) {
        let counters = self.counters(modality);
        counters.admitted.fetch_add(1, Ordering::Relaxed);
        if redacted {
            counters.redacted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_policy_drop(&self, modality: Modality) {
        self.counters(modality)
            .dropped_by_policy
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure_drop(&self, modality: Modality) {
        self.counters(modality)
            .dropped_by_backpressure
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttled(&self, modality: Modality) {
        self.counters(modality).throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_analyzer_failure(&self, modality: Modality) {
        self.counters(modality)
            .analyzer_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count a published result and fold its capture-to-publish latency into the average
    pub fn record_published(&self, modality: Modality, latency: Duration) {
        let counters = self.counters(modality);
        counters.published.fetch_add(1, Ordering::Relaxed);

        let sample = latency.as_micros().min(u64::MAX as u128) as u64;
        let previous = counters.latency_ewma_us.load(Ordering::Relaxed);
        let next = if previous == 0 {
            sample
        } else {
            (previous * (EWMA_WEIGHT - 1) + sample) / EWMA_WEIGHT
        };
        counters.latency_ewma_us.store(next, Ordering::Relaxed);
    }

    pub fn record_insight(&self) {
        self.insights_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_inbound(&self) {
        self.malformed_inbound.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Rolling average capture-to-publish latency
    pub fn average_latency(&self, modality: Modality) -> Duration {
        Duration::from_micros(self.counters(modality).latency_ewma_us.load(Ordering::Relaxed))
    }

    /// Whether the modality is running over its latency budget. Audio is never throttled.
    pub fn should_throttle(&self, modality: Modality) -> bool {
        if modality == Modality::Audio {
            return false;
        }
        let budget = self.latency_budgets[modality.index()];
        !budget.is_zero() && self.average_latency(modality) > budget
    }

    pub fn insights_emitted(&self) -> u64 {
        self.insights_emitted.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.started_at.elapsed();

        let modalities: Vec<ModalitySnapshot> = Modality::ALL
            .iter()
            .map(|&modality| {
                let c = self.counters(modality);
                ModalitySnapshot {
                    modality,
                    submitted: c.submitted.load(Ordering::Relaxed),
                    admitted: c.admitted.load(Ordering::Relaxed),
                    redacted: c.redacted.load(Ordering::Relaxed),
                    dropped_by_policy: c.dropped_by_policy.load(Ordering::Relaxed),
                    dropped_by_backpressure: c.dropped_by_backpressure.load(Ordering::Relaxed),
                    throttled: c.throttled.load(Ordering::Relaxed),
                    analyzer_failures: c.analyzer_failures.load(Ordering::Relaxed),
                    published: c.published.load(Ordering::Relaxed),
                    avg_latency_ms: c.latency_ewma_us.load(Ordering::Relaxed) as f64 / 1000.0,
                }
            })
            .collect();

        let published: u64 = modalities.iter().map(|m| m.published).sum();
        let uptime_secs = uptime.as_secs_f64();
        let throughput_per_sec = if uptime_secs > 0.0 {
            published as f64 / uptime_secs
        } else {
            0.0
        };

        MetricsSnapshot {
            started_at: self.started_wall,
            uptime_secs,
            throughput_per_sec,
            insights_emitted: self.insights_emitted.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            malformed_inbound: self.malformed_inbound.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            modalities,
        }
    }
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: f64,
    /// Published analysis results per second since start
    pub throughput_per_sec: f64,
    pub insights_emitted: u64,
    pub messages_sent: u64,
    pub malformed_inbound: u64,
    pub reconnect_attempts: u64,
    pub modalities: Vec<ModalitySnapshot>,
}

impl MetricsSnapshot {
    pub fn modality(&self, modality: Modality) -> Option<&ModalitySnapshot> {
        self.modalities.iter().find(|m| m.modality == modality)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModalitySnapshot {
    pub modality: Modality,
    pub submitted: u64,
    pub admitted: u64,
    pub redacted: u64,
    pub dropped_by_policy: u64,
    pub dropped_by_backpressure: u64,
    pub throttled: u64,
    pub analyzer_failures: u64,
    pub published: u64,
    pub avg_latency_ms: f64,
}
