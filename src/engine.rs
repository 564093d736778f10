//! Coaching engine: wires the pipeline, fusion coordinator and session together

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::AnalyzerSet;
use crate::config::Config;
use crate::error::SessionErrorEvent;
use crate::fusion::{FusedInsight, FusionControl, FusionCoordinator, FusionSink};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::modality::{AnalysisResult, Modality, ModalitySample, SamplePayload};
use crate::pipeline::{Generation, IngestionPipeline};
use crate::privacy::ConsentStore;
use crate::session::{ReplyEvent, SessionHandle, SessionState};
use crate::transport::{CoachingTransport, TranscriptionPayload};

/// Everything the UI needs to render a coaching session
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EngineEvent {
    State(SessionState),
    Insight(FusedInsight),
    Transcription(TranscriptionPayload),
    Reply(ReplyEvent),
    Error(SessionErrorEvent),
    Metrics(MetricsSnapshot),
}

/// Routes fusion output to the session and the UI
struct EngineSink {
    session: SessionHandle,
    events: broadcast::Sender<EngineEvent>,
}

impl FusionSink for EngineSink {
    fn forward_context(&self, result: AnalysisResult) {
        self.session.send_context(result);
    }

    fn emit_insight(&self, insight: FusedInsight) {
        let _ = self.events.send(EngineEvent::Insight(insight.clone()));
        self.session.send_insight(insight);
    }
}

/// One running coaching session and all of its tasks
pub struct CoachingEngine {
    session: SessionHandle,
    pipeline: IngestionPipeline,
    fusion: FusionControl,
    metrics: Arc<MetricsAggregator>,
    events: broadcast::Sender<EngineEvent>,
    generation: Generation,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl CoachingEngine {
    /// Spawn every engine task. The session starts disconnected.
    pub fn start(
        config: &Config,
        transport: Box<dyn CoachingTransport>,
        analyzers: AnalyzerSet,
        consent: Arc<dyn ConsentStore>,
    ) -> Self {
        let metrics = Arc::new(MetricsAggregator::new(config.pipeline.latency_budgets()));
        let cancel = CancellationToken::new();
        let generation = Generation::new();
        let (results, _) = broadcast::channel(config.engine.result_capacity.max(1));
        let (events, _) = broadcast::channel(config.engine.event_capacity.max(1));

        info!("Starting coaching engine for session {}", config.session.session_id);

        let (session, session_task) = SessionHandle::spawn(
            config.session.clone(),
            config.transport.clone(),
            transport,
            Arc::clone(&metrics),
            cancel.clone(),
        );

        let sink = Arc::new(EngineSink {
            session: session.clone(),
            events: events.clone(),
        });
        let (fusion, fusion_task) = FusionCoordinator::spawn(
            config.fusion.clone(),
            results.subscribe(),
            sink,
            Arc::clone(&metrics),
            cancel.clone(),
        );

        let bridge = Bridge {
            session: session.clone(),
            fusion: fusion.clone(),
            metrics: Arc::clone(&metrics),
            events: events.clone(),
            results: results.subscribe(),
            states: session.subscribe_states(),
            transcriptions: session.subscribe_transcriptions(),
            replies: session.subscribe_replies(),
            errors: session.subscribe_errors(),
        };
        let bridge_task = tokio::spawn(bridge.run(config.engine.metrics_interval(), cancel.clone()));

        let (pipeline, worker_tasks) = IngestionPipeline::spawn(
            &config.pipeline,
            &analyzers,
            consent,
            results,
            Arc::clone(&metrics),
            generation.clone(),
            cancel.clone(),
        );

        let mut tasks = worker_tasks;
        tasks.extend([session_task, fusion_task, bridge_task]);

        Self {
            session,
            pipeline,
            fusion,
            metrics,
            events,
            generation,
            cancel,
            tasks,
        }
    }

    /// Hand a capture sample to the pipeline; never blocks
    pub fn submit(&self, modality: Modality, payload: SamplePayload, confidence: f32) {
        self.pipeline.submit(modality, payload, confidence);
    }

    pub fn submit_sample(&self, sample: ModalitySample) {
        self.pipeline.submit_sample(sample);
    }

    pub fn connect(&self) -> Result<()> {
        self.session.connect()
    }

    pub fn disconnect(&self) -> Result<()> {
        self.session.disconnect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_fusion_suspended(&self) -> bool {
        self.fusion.is_suspended()
    }

    /// Stop every task as a unit. In-flight analyzer results are discarded.
    pub async fn shutdown(self) -> MetricsSnapshot {
        info!("Shutting down session {}", self.session.session_id());

        self.generation.bump();
        self.cancel.cancel();
        drop(self.pipeline);

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {}", e);
            }
        }

        self.metrics.snapshot()
    }
}

/// Fans session and pipeline activity out to the UI and back into the engine
struct Bridge {
    session: SessionHandle,
    fusion: FusionControl,
    metrics: Arc<MetricsAggregator>,
    events: broadcast::Sender<EngineEvent>,
    results: broadcast::Receiver<AnalysisResult>,
    states: broadcast::Receiver<SessionState>,
    transcriptions: broadcast::Receiver<TranscriptionPayload>,
    replies: broadcast::Receiver<ReplyEvent>,
    errors: broadcast::Receiver<SessionErrorEvent>,
}

impl Bridge {
    async fn run(mut self, metrics_interval: std::time::Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(metrics_interval.max(std::time::Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = ticker.tick() => self.emit(EngineEvent::Metrics(self.metrics.snapshot())),

                result = self.results.recv() => match result {
                    Ok(result) => self.on_result(result),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Engine bridge skipped {} analysis results", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                state = self.states.recv() => {
                    if let Some(state) = received(state, "state") {
                        if state == SessionState::Active {
                            self.fusion.resume();
                        }
                        self.emit(EngineEvent::State(state));
                    }
                }

                transcription = self.transcriptions.recv() => {
                    if let Some(transcription) = received(transcription, "transcription") {
                        self.emit(EngineEvent::Transcription(transcription));
                    }
                }

                reply = self.replies.recv() => {
                    if let Some(reply) = received(reply, "reply") {
                        self.emit(EngineEvent::Reply(reply));
                    }
                }

                error = self.errors.recv() => {
                    if let Some(error) = received(error, "error") {
                        if error.is_fatal() {
                            self.fusion.suspend();
                        }
                        self.emit(EngineEvent::Error(error));
                    }
                }
            }
        }

        debug!("Engine bridge stopped");
    }

    fn on_result(&self, result: AnalysisResult) {
        if result.modality != Modality::Audio {
            return;
        }
        if let Some(level) = result.speech_level() {
            self.session.report_speech_activity(level, result.captured_at);
        }
        self.session.send_audio(result);
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is normal for headless sessions
        let _ = self.events.send(event);
    }
}

fn received<T>(value: Result<T, broadcast::error::RecvError>, stream: &str) -> Option<T> {
    match value {
        Ok(value) => Some(value),
        Err(broadcast::error::RecvError::Lagged(n)) => {
            warn!("Engine bridge skipped {} session {} events", n, stream);
            None
        }
        Err(broadcast::error::RecvError::Closed) => None,
    }
}
