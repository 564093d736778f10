//! Fusion coordinator
//!
//! Collects analysis results from every modality in a short-lived cache and,
//! on a fixed tick, decides whether enough corroborating evidence exists to
//! emit a [`FusedInsight`]. The decision logic lives in [`FusionState`],
//! which takes the current instant explicitly; [`FusionCoordinator`] drives
//! it from a timer and the shared result channel.

pub mod cache;
pub mod insight;

pub use cache::{PendingAnalysis, PendingCache};
pub use insight::{Category, FusedInsight, Priority, Recommendation};

use chrono::Utc;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::MetricsAggregator;
use crate::modality::{AnalysisResult, Modality};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub tick_interval_ms: u64,
    /// Cached analyses older than this are purged before each evaluation
    pub retention_ms: u64,
    /// Upper bound on cached analyses
    pub max_pending: usize,
    /// Pose must have updated within this window for fusion to fire
    pub pose_freshness_ms: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            retention_ms: 5000,
            max_pending: 5,
            pose_freshness_ms: 1000,
        }
    }
}

impl FusionConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn pose_freshness(&self) -> Duration {
        Duration::from_millis(self.pose_freshness_ms)
    }
}

/// Cache plus trigger bookkeeping, owned by the coordinator task
#[derive(Debug)]
pub struct FusionState {
    config: FusionConfig,
    cache: PendingCache,
    last_pose_update: Option<Instant>,
    suspended: bool,
}

impl FusionState {
    pub fn new(config: FusionConfig) -> Self {
        let cache = PendingCache::new(config.max_pending);
        Self {
            config,
            cache,
            last_pose_update: None,
            suspended: false,
        }
    }

    /// Cache a result. Returns false if its id was already cached.
    pub fn ingest(&mut self, result: AnalysisResult, now: Instant) -> bool {
        if result.modality == Modality::Pose {
            self.last_pose_update = Some(now);
        }
        let inserted = self.cache.insert(result, now);
        if !inserted {
            debug!("Ignoring duplicate analysis");
        }
        inserted
    }

    /// Evaluate the trigger; on success the cache is consumed into an insight
    pub fn tick(&mut self, now: Instant) -> Option<FusedInsight> {
        let purged = self.cache.purge(now, self.config.retention());
        if purged > 0 {
            debug!("Purged {} expired analyses", purged);
        }

        if self.suspended || !self.should_fire(now) {
            return None;
        }

        let insight = self.fuse();
        self.cache.clear();
        Some(insight)
    }

    fn should_fire(&self, now: Instant) -> bool {
        let pose_fresh = self
            .last_pose_update
            .map(|at| now.saturating_duration_since(at) < self.config.pose_freshness())
            .unwrap_or(false);

        // Capacity is enforced by eviction on insert
        debug_assert!(self.cache.len() <= self.cache.capacity());

        self.cache.distinct_modalities().len() >= 2 && pose_fresh
    }

    fn fuse(&self) -> FusedInsight {
        let entries = self.cache.by_arrival();

        let confidence =
            entries.iter().map(|e| e.result.confidence).sum::<f32>() / entries.len().max(1) as f32;

        // Per modality: its most urgent category and the entry that earned it.
        // Entries arrive in order, so the first hit per modality is the earliest.
        let mut strongest: BTreeMap<Modality, (Category, &PendingAnalysis)> = BTreeMap::new();
        for &entry in &entries {
            let category = Category::for_result(entry.result.result_type);
            strongest
                .entry(entry.result.modality)
                .and_modify(|slot| {
                    if category < slot.0 {
                        *slot = (category, entry);
                    }
                })
                .or_insert((category, entry));
        }

        let mut ranked: Vec<(Category, &PendingAnalysis)> = strongest.into_values().collect();
        ranked.sort_by_key(|(category, entry)| (category.priority(), entry.arrival));

        let recommendations = ranked
            .into_iter()
            .map(|(category, entry)| Recommendation::from_result(category, &entry.result))
            .collect();

        FusedInsight {
            id: uuid::Uuid::new_v4().to_string(),
            contributing_modalities: entries.iter().map(|e| e.result.modality).collect(),
            confidence,
            recommendations,
            produced_at: Utc::now(),
        }
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn pending(&self) -> usize {
        self.cache.len()
    }

    pub fn distinct_modalities(&self) -> BTreeSet<Modality> {
        self.cache.distinct_modalities()
    }
}

/// Where the coordinator sends its output
pub trait FusionSink: Send + Sync {
    /// Raw pose result, forwarded as continuous session context
    fn forward_context(&self, result: AnalysisResult);

    fn emit_insight(&self, insight: FusedInsight);
}

/// Handle used to pause and resume insight emission
#[derive(Debug, Clone)]
pub struct FusionControl {
    tx: Arc<watch::Sender<bool>>,
}

impl FusionControl {
    pub fn suspend(&self) {
        if !self.tx.send_replace(true) {
            info!("Fusion suspended");
        }
    }

    pub fn resume(&self) {
        if self.tx.send_replace(false) {
            info!("Fusion resumed");
        }
    }

    pub fn is_suspended(&self) -> bool {
        *self.tx.borrow()
    }
}

pub struct FusionCoordinator {
    state: FusionState,
    results: broadcast::Receiver<AnalysisResult>,
    control: watch::Receiver<bool>,
    sink: Arc<dyn FusionSink>,
    metrics: Arc<MetricsAggregator>,
}

impl FusionCoordinator {
    /// Spawn the periodic fusion task
    pub fn spawn(
        config: FusionConfig,
        results: broadcast::Receiver<AnalysisResult>,
        sink: Arc<dyn FusionSink>,
        metrics: Arc<MetricsAggregator>,
        cancel: CancellationToken,
    ) -> (FusionControl, JoinHandle<()>) {
        let (tx, control) = watch::channel(false);
        let coordinator = Self {
            state: FusionState::new(config),
            results,
            control,
            sink,
            metrics,
        };

        let handle = tokio::spawn(coordinator.run(cancel));
        (FusionControl { tx: Arc::new(tx) }, handle)
    }

    async fn run(mut self, cancel: CancellationToken) {
        let tick_interval = self.state.config.tick_interval();
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Fusion coordinator started (tick {:?})", tick_interval);

        let mut control_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    if let Some(insight) = self.state.tick(Instant::now()) {
                        info!(
                            "Fused insight from {:?} (confidence {:.2}, {} recommendations)",
                            insight.contributing_modalities,
                            insight.confidence,
                            insight.recommendations.len()
                        );
                        self.metrics.record_insight();
                        self.sink.emit_insight(insight);
                    }
                }

                changed = self.control.changed(), if control_open => {
                    if changed.is_err() {
                        control_open = false;
                    } else {
                        let suspended = *self.control.borrow_and_update();
                        self.state.set_suspended(suspended);
                    }
                }

                received = self.results.recv() => match received {
                    Ok(result) => {
                        if result.modality == Modality::Pose {
                            self.sink.forward_context(result.clone());
                        }
                        self.state.ingest(result, Instant::now());
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Fusion fell behind, skipped {} results", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        info!("Fusion coordinator stopped");
    }
}
