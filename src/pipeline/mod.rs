//! Stream ingestion pipeline
//!
//! `submit` hands a raw sample to a per-modality queue and returns
//! immediately. One long-lived worker per modality drains its queue, applies
//! the privacy gate, runs the analyzer in its own task under a timeout, and
//! publishes admitted results on the shared broadcast channel.

pub mod chunk;
pub mod queue;

pub use chunk::{AudioCoalescer, CoalescedChunk};

use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::{AnalyzerSet, ModalityAnalyzer};
use crate::error::AnalysisError;
use crate::metrics::MetricsAggregator;
use crate::modality::{AnalysisResult, AudioChunk, Modality, ModalitySample, SamplePayload};
use crate::privacy::{self, ConsentStore, Decision};
use queue::{QueueReceiver, QueueSender};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pending pose samples before the oldest is displaced
    pub pose_queue_depth: usize,
    /// Pending vision frames before the oldest is displaced
    pub vision_queue_depth: usize,
    /// Samples per coalesced audio chunk
    pub audio_chunk_samples: usize,
    pub audio_sample_rate: u32,
    pub pose_timeout_ms: u64,
    pub audio_timeout_ms: u64,
    pub vision_timeout_ms: u64,
    /// Rolling latency above which pose samples are thinned (0 disables)
    pub pose_latency_budget_ms: u64,
    /// Rolling latency above which vision frames are thinned (0 disables)
    pub vision_latency_budget_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pose_queue_depth: 2,
            vision_queue_depth: 1,
            audio_chunk_samples: 1600, // 100ms at 16kHz
            audio_sample_rate: 16000,
            pose_timeout_ms: 30,
            audio_timeout_ms: 100,
            vision_timeout_ms: 150,
            pose_latency_budget_ms: 60,
            vision_latency_budget_ms: 400,
        }
    }
}

impl PipelineConfig {
    pub fn analyzer_timeout(&self, modality: Modality) -> Duration {
        Duration::from_millis(match modality {
            Modality::Pose => self.pose_timeout_ms,
            Modality::Audio => self.audio_timeout_ms,
            Modality::Vision => self.vision_timeout_ms,
        })
    }

    /// Budgets indexed pose, audio, vision
    pub fn latency_budgets(&self) -> [Duration; 3] {
        [
            Duration::from_millis(self.pose_latency_budget_ms),
            Duration::ZERO,
            Duration::from_millis(self.vision_latency_budget_ms),
        ]
    }
}

/// Monotonic session generation. Results started under an older generation are discarded.
#[derive(Debug, Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Invalidate everything in flight
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

struct RawAudio {
    chunk: AudioChunk,
    confidence: f32,
    captured_at: Instant,
}

/// Entry point for capture callbacks
pub struct IngestionPipeline {
    pose_tx: QueueSender<ModalitySample>,
    vision_tx: QueueSender<ModalitySample>,
    audio_tx: mpsc::UnboundedSender<RawAudio>,
    metrics: Arc<MetricsAggregator>,
}

impl IngestionPipeline {
    /// Start the three modality workers
    pub fn spawn(
        config: &PipelineConfig,
        analyzers: &AnalyzerSet,
        consent: Arc<dyn ConsentStore>,
        results: broadcast::Sender<AnalysisResult>,
        metrics: Arc<MetricsAggregator>,
        generation: Generation,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (pose_tx, pose_rx) = queue::drop_oldest(config.pose_queue_depth);
        let (vision_tx, vision_rx) = queue::drop_oldest(config.vision_queue_depth);
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();

        let worker = |modality: Modality| ModalityWorker {
            modality,
            analyzer: analyzers.get(modality),
            timeout: config.analyzer_timeout(modality),
            consent: Arc::clone(&consent),
            results: results.clone(),
            metrics: Arc::clone(&metrics),
            generation: generation.clone(),
        };

        let handles = vec![
            tokio::spawn(run_frames(worker(Modality::Pose), pose_rx, cancel.clone())),
            tokio::spawn(run_frames(worker(Modality::Vision), vision_rx, cancel.clone())),
            tokio::spawn(run_audio(
                worker(Modality::Audio),
                audio_rx,
                AudioCoalescer::new(config.audio_chunk_samples, config.audio_sample_rate),
                cancel,
            )),
        ];

        info!(
            "Ingestion pipeline started (pose depth {}, vision depth {}, audio chunk {} samples)",
            config.pose_queue_depth, config.vision_queue_depth, config.audio_chunk_samples
        );

        (
            Self {
                pose_tx,
                vision_tx,
                audio_tx,
                metrics,
            },
            handles,
        )
    }

    /// Fire-and-forget submission from a capture callback
    pub fn submit(&self, modality: Modality, payload: SamplePayload, confidence: f32) {
        if payload.modality() != modality {
            warn!(
                "Ignoring {} payload submitted as {}",
                payload.modality(),
                modality
            );
            return;
        }
        self.submit_sample(ModalitySample::new(payload, confidence));
    }

    /// Submit an already-stamped sample
    pub fn submit_sample(&self, sample: ModalitySample) {
        let modality = sample.modality;
        self.metrics.record_submitted(modality);

        match sample.payload {
            SamplePayload::Audio(chunk) => {
                let raw = RawAudio {
                    chunk,
                    confidence: sample.confidence,
                    captured_at: sample.captured_at,
                };
                if self.audio_tx.send(raw).is_err() {
                    debug!("Audio worker stopped, sample discarded");
                }
            }
            SamplePayload::Pose(_) | SamplePayload::Vision(_) => {
                let tx = if modality == Modality::Pose {
                    &self.pose_tx
                } else {
                    &self.vision_tx
                };
                if tx.push(sample).is_some() {
                    self.metrics.record_backpressure_drop(modality);
                    debug!("{} queue full, displaced oldest sample", modality);
                }
            }
        }
    }
}

struct ModalityWorker {
    modality: Modality,
    analyzer: Arc<dyn ModalityAnalyzer>,
    timeout: Duration,
    consent: Arc<dyn ConsentStore>,
    results: broadcast::Sender<AnalysisResult>,
    metrics: Arc<MetricsAggregator>,
    generation: Generation,
}

impl ModalityWorker {
    async fn process(&self, sample: ModalitySample) {
        let policy = self.consent.current_policy();
        let (sample, redacted) = match privacy::admit(sample, &policy) {
            Decision::Drop => {
                self.metrics.record_policy_drop(self.modality);
                return;
            }
            Decision::Allow(sample) => (sample, false),
            Decision::Redact(sample) => (sample, true),
        };
        self.metrics.record_admitted(self.modality, redacted);

        let generation = self.generation.current();
        let analyzer = Arc::clone(&self.analyzer);
        let task = tokio::spawn(async move { analyzer.analyze(&sample).await });

        // A timed-out invocation keeps running detached; its result is dropped with the handle
        let outcome = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AnalysisError::Panicked {
                modality: self.modality,
            }),
            Err(_) => Err(AnalysisError::Timeout {
                modality: self.modality,
                after: self.timeout,
            }),
        };

        match outcome {
            Ok(result) => self.publish(result, generation),
            Err(e) => {
                warn!("Recoverable analyzer failure ({}): {}", self.analyzer.name(), e);
                self.metrics.record_analyzer_failure(self.modality);
            }
        }
    }

    fn publish(&self, result: AnalysisResult, generation: u64) {
        if self.generation.current() != generation {
            debug!("Discarding {} result {} from a torn-down session", self.modality, result.id);
            return;
        }

        let latency = Instant::now().saturating_duration_since(result.captured_at);
        self.metrics.record_published(self.modality, latency);

        if self.results.send(result).is_err() {
            debug!("No subscribers for {} result", self.modality);
        }
    }
}

async fn run_frames(
    worker: ModalityWorker,
    mut rx: QueueReceiver<ModalitySample>,
    cancel: CancellationToken,
) {
    info!("{} worker started ({})", worker.modality, worker.analyzer.name());

    let mut sequence: u64 = 0;
    loop {
        let sample = tokio::select! {
            _ = cancel.cancelled() => break,
            sample = rx.recv() => match sample {
                Some(sample) => sample,
                None => break,
            },
        };

        sequence += 1;
        if sequence % 2 == 0 && worker.metrics.should_throttle(worker.modality) {
            worker.metrics.record_throttled(worker.modality);
            continue;
        }

        worker.process(sample).await;
    }

    info!("{} worker stopped", worker.modality);
}

async fn run_audio(
    worker: ModalityWorker,
    mut rx: mpsc::UnboundedReceiver<RawAudio>,
    mut coalescer: AudioCoalescer,
    cancel: CancellationToken,
) {
    info!("audio worker started ({})", worker.analyzer.name());

    loop {
        let raw = tokio::select! {
            _ = cancel.cancelled() => {
                // Audio already queued is never dropped
                while let Ok(raw) = rx.try_recv() {
                    for chunk in coalescer.push(raw.chunk, raw.confidence, raw.captured_at) {
                        worker.process(chunk_sample(chunk)).await;
                    }
                }
                break;
            }
            raw = rx.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        for chunk in coalescer.push(raw.chunk, raw.confidence, raw.captured_at) {
            worker.process(chunk_sample(chunk)).await;
        }
    }

    // Closed or cancelled: analyze the trailing partial chunk
    if let Some(tail) = coalescer.flush() {
        worker.process(chunk_sample(tail)).await;
    }

    info!("audio worker stopped");
}

fn chunk_sample(chunk: CoalescedChunk) -> ModalitySample {
    ModalitySample::captured(
        SamplePayload::Audio(chunk.chunk),
        chunk.confidence,
        chunk.captured_at,
    )
}
