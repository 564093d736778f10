//! Coaching session management
//!
//! This module provides the `SessionHandle` abstraction over one long-lived
//! session task that manages:
//! - The transport lifecycle (connect, setup, reconnect, disconnect)
//! - Buffering of outbound content until the session is active
//! - Barge-in: cancelling the coach's reply when the user talks over it
//! - The state, transcription, reply and error event streams

mod barge_in;
mod buffer;
mod config;
mod machine;
mod state;

pub use barge_in::BargeInDetector;
pub use buffer::{InboundTurn, Outbound, PendingBuffer};
pub use config::{BargeInConfig, SessionConfig};
pub use state::{transition, Effect, SessionState, Trigger};

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SessionErrorEvent;
use crate::fusion::FusedInsight;
use crate::metrics::MetricsAggregator;
use crate::modality::{AnalysisData, AnalysisResult};
use crate::transport::{CoachingTransport, ContextPayload, TranscriptionPayload, TransportConfig};
use machine::{Command, SessionChannels, SessionMachine};

/// Capacity of each session event stream
const EVENT_CAPACITY: usize = 64;

/// Coach reply stream entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyEvent {
    Text { text: String, turn_complete: bool },
    /// The user barged in; the output channel is free for new input
    Interrupted,
}

/// Cheap, cloneable handle to a running session task
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    channels: SessionChannels,
}

impl SessionHandle {
    /// Spawn the session task. It starts `Disconnected`; call `connect` to begin.
    pub fn spawn(
        config: SessionConfig,
        transport_config: TransportConfig,
        transport: Box<dyn CoachingTransport>,
        metrics: Arc<MetricsAggregator>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionState::Disconnected);
        let channels = SessionChannels::new(EVENT_CAPACITY);
        let session_id = config.session_id.clone();

        let machine = SessionMachine::new(
            config,
            transport_config,
            transport,
            metrics,
            state_tx,
            channels.clone(),
        );
        let handle = tokio::spawn(machine.run(command_rx, cancel));

        (
            Self {
                session_id,
                commands,
                state,
                channels,
            },
            handle,
        )
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("Session {} is no longer running", self.session_id))
    }

    fn send(&self, item: Outbound) {
        let kind = item.kind();
        if self.commands.send(Command::Send(item)).is_err() {
            debug!("Session stopped, {} discarded", kind);
        }
    }

    /// Queue a fused insight as the next coaching request
    pub fn send_insight(&self, insight: FusedInsight) {
        self.send(Outbound::Insight(insight));
    }

    /// Forward a pose result as continuous context. Local-only results stay on the device.
    pub fn send_context(&self, result: AnalysisResult) {
        if !result.egress.may_upload() {
            debug!("Keeping local-only {} result {} on device", result.modality, result.id);
            return;
        }

        let data = match serde_json::to_value(&result.data) {
            Ok(data) => data,
            Err(e) => {
                debug!("Failed to encode context {}: {}", result.id, e);
                return;
            }
        };

        self.send(Outbound::Context(ContextPayload {
            analysis_id: result.id,
            modality: result.modality,
            result_type: result.result_type,
            confidence: result.confidence,
            data,
            timestamp: result.produced_at.to_rfc3339(),
        }));
    }

    /// Upload microphone audio for transcription, if its raw PCM may leave the device
    pub fn send_audio(&self, result: AnalysisResult) {
        if !result.egress.may_upload() {
            return;
        }
        if let AnalysisData::Audio(features) = result.data {
            if let Some(pcm) = features.pcm {
                self.send(Outbound::Audio {
                    pcm,
                    sample_rate: features.sample_rate,
                });
            }
        }
    }

    /// Speech level for barge-in detection
    pub fn report_speech_activity(&self, level: f32, at: Instant) {
        let _ = self.commands.send(Command::SpeechActivity { level, at });
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the session reaches `target`, up to `timeout`
    pub async fn wait_for_state(&self, target: SessionState, timeout: Duration) -> Result<()> {
        let mut rx = self.state.clone();
        tokio::time::timeout(timeout, async {
            loop {
                if *rx.borrow_and_update() == target {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(anyhow!("Session {} stopped", self.session_id));
                }
            }
        })
        .await
        .map_err(|_| anyhow!("Timed out waiting for session state {}", target))?
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<SessionState> {
        self.channels.states.subscribe()
    }

    pub fn subscribe_transcriptions(&self) -> broadcast::Receiver<TranscriptionPayload> {
        self.channels.transcriptions.subscribe()
    }

    pub fn subscribe_replies(&self) -> broadcast::Receiver<ReplyEvent> {
        self.channels.replies.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<SessionErrorEvent> {
        self.channels.errors.subscribe()
    }
}
