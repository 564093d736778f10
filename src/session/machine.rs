//! The session task
//!
//! Owns the transport and the single live [`SessionState`]. Every state change
//! goes through [`transition`]; the effect it names is performed here, and an
//! effect may produce a follow-up trigger (handshake succeeded, setup sent,
//! retries exhausted) which is processed before the next command.

use anyhow::Result;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::barge_in::BargeInDetector;
use super::buffer::{InboundTurn, Outbound, PendingBuffer};
use super::config::SessionConfig;
use super::state::{transition, Effect, SessionState, Trigger};
use super::ReplyEvent;
use crate::error::{SessionError, SessionErrorEvent};
use crate::metrics::MetricsAggregator;
use crate::modality::Modality;
use crate::transport::{
    AudioPayload, CancelPayload, CoachingTransport, InboundMessage, OutboundMessage, SetupPayload,
    TranscriptionPayload, TransportConfig,
};

pub(crate) enum Command {
    Connect,
    Disconnect,
    Send(Outbound),
    SpeechActivity { level: f32, at: Instant },
}

/// Broadcast side of the session's observable streams
#[derive(Clone)]
pub(crate) struct SessionChannels {
    pub states: broadcast::Sender<SessionState>,
    pub transcriptions: broadcast::Sender<TranscriptionPayload>,
    pub replies: broadcast::Sender<ReplyEvent>,
    pub errors: broadcast::Sender<SessionErrorEvent>,
}

impl SessionChannels {
    pub fn new(capacity: usize) -> Self {
        Self {
            states: broadcast::channel(capacity).0,
            transcriptions: broadcast::channel(capacity).0,
            replies: broadcast::channel(capacity).0,
            errors: broadcast::channel(capacity).0,
        }
    }
}

pub(crate) struct SessionMachine {
    config: SessionConfig,
    transport_config: TransportConfig,
    transport: Box<dyn CoachingTransport>,
    metrics: Arc<MetricsAggregator>,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    channels: SessionChannels,
    inbound: Option<mpsc::Receiver<Vec<u8>>>,
    setup_deadline: Option<Instant>,
    retry_at: Option<Instant>,
    /// Consecutive failures since the last acknowledged setup
    failures: u32,
    last_failure: Option<SessionError>,
    cycle: u64,
    pending: PendingBuffer,
    barge_in: BargeInDetector,
    reply_in_progress: bool,
    audio_sequence: u64,
}

impl SessionMachine {
    pub fn new(
        config: SessionConfig,
        transport_config: TransportConfig,
        transport: Box<dyn CoachingTransport>,
        metrics: Arc<MetricsAggregator>,
        state_tx: watch::Sender<SessionState>,
        channels: SessionChannels,
    ) -> Self {
        let pending = PendingBuffer::new(config.pending_limit);
        let barge_in = BargeInDetector::new(&config.barge_in);
        Self {
            config,
            transport_config,
            transport,
            metrics,
            state: SessionState::Disconnected,
            state_tx,
            channels,
            inbound: None,
            setup_deadline: None,
            retry_at: None,
            failures: 0,
            last_failure: None,
            cycle: 0,
            pending,
            barge_in,
            reply_in_progress: false,
            audio_sequence: 0,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        info!(
            "Session {} started ({} transport)",
            self.config.session_id,
            self.transport.name()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                frame = next_frame(&mut self.inbound) => match frame {
                    Some(bytes) => self.handle_inbound(&bytes).await,
                    None => {
                        self.inbound = None;
                        let error = SessionError::Transport {
                            reason: "coaching service closed the connection".to_string(),
                        };
                        self.fail(Trigger::TransportFault, error).await;
                    }
                },

                _ = wait_until(self.setup_deadline) => {
                    self.setup_deadline = None;
                    let error = SessionError::ConnectionTimeout {
                        after: self.config.setup_timeout(),
                    };
                    self.fail(Trigger::Timeout, error).await;
                }

                _ = wait_until(self.retry_at) => {
                    self.retry_at = None;
                    self.drive(Trigger::Retry).await;
                }
            }
        }

        self.drive(Trigger::Disconnect).await;
        info!("Session {} stopped", self.config.session_id);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.drive(Trigger::Connect).await,
            Command::Disconnect => self.drive(Trigger::Disconnect).await,
            Command::Send(item) => self.enqueue(item).await,
            Command::SpeechActivity { level, at } => self.observe_speech(level, at).await,
        }
    }

    /// Apply `trigger` and any follow-ups its effects produce
    async fn drive(&mut self, trigger: Trigger) {
        let mut queue = VecDeque::from([trigger]);

        while let Some(trigger) = queue.pop_front() {
            let Some((next, effect)) = transition(self.state, trigger) else {
                debug!("Ignoring {:?} while {}", trigger, self.state);
                continue;
            };

            self.set_state(next);

            if let Some(follow_up) = self.perform(effect).await {
                queue.push_back(follow_up);
            }
        }
    }

    fn set_state(&mut self, next: SessionState) {
        info!("Session {}: {} -> {}", self.config.session_id, self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
        let _ = self.channels.states.send(next);
    }

    async fn perform(&mut self, effect: Effect) -> Option<Trigger> {
        match effect {
            Effect::OpenTransport => self.open_transport().await,

            Effect::SendSetup => {
                let setup = OutboundMessage::Setup(SetupPayload {
                    session_id: self.config.session_id.clone(),
                    model: self.transport_config.model.clone(),
                    instructions: self.transport_config.instructions.clone(),
                    modalities: Modality::ALL.to_vec(),
                });
                match self.transport.send(&setup).await {
                    Ok(()) => {
                        self.metrics.record_message_sent();
                        Some(Trigger::SetupSent)
                    }
                    Err(e) => Some(self.transport_fault(e)),
                }
            }

            Effect::ArmSetupTimer => {
                self.setup_deadline = Some(Instant::now() + self.config.setup_timeout());
                None
            }

            Effect::ResetFailures => {
                self.setup_deadline = None;
                self.failures = 0;
                info!("Coaching session ready (setup cycle {})", self.cycle);
                // Anything buffered (either direction) is the first turn
                (!self.pending.is_empty()).then_some(Trigger::FirstTurn)
            }

            Effect::FlushBuffered => {
                for turn in self.pending.drain_turns() {
                    self.deliver(turn);
                }

                let mut buffered = VecDeque::from(self.pending.drain());
                if !buffered.is_empty() {
                    debug!("Flushing {} buffered messages", buffered.len());
                }
                while let Some(item) = buffered.pop_front() {
                    let retry = item.clone();
                    if let Err(e) = self.send_outbound(item).await {
                        buffered.push_front(retry);
                        self.pending.carry_over(buffered.into());
                        return Some(self.transport_fault(e));
                    }
                }
                None
            }

            Effect::RecordFailure => self.record_failure().await,

            Effect::GiveUp => {
                let attempts = self.failures;
                error!(
                    "Session {} gave up after {} consecutive failures",
                    self.config.session_id, attempts
                );
                self.pending.clear();
                self.retry_at = None;
                self.failures = 0;
                self.emit_error(SessionErrorEvent::fatal(SessionError::ReconnectExhausted {
                    attempts,
                }));
                None
            }

            Effect::CloseTransport => {
                self.setup_deadline = None;
                self.retry_at = None;
                self.close_transport().await;
                Some(Trigger::Closed)
            }

            Effect::DropBuffers => {
                self.pending.clear();
                self.failures = 0;
                self.reply_in_progress = false;
                self.barge_in.reset();
                None
            }
        }
    }

    async fn open_transport(&mut self) -> Option<Trigger> {
        self.cycle += 1;
        self.pending.begin_cycle(self.cycle);
        self.reply_in_progress = false;

        let timeout = self.config.handshake_timeout();
        info!(
            "Opening {} transport (setup cycle {})",
            self.transport.name(),
            self.cycle
        );

        match tokio::time::timeout(timeout, self.transport.open(&self.transport_config)).await {
            Ok(Ok(inbound)) => {
                self.inbound = Some(inbound);
                Some(Trigger::HandshakeOk)
            }
            Ok(Err(e)) => Some(self.transport_fault(e)),
            Err(_) => {
                self.last_failure = Some(SessionError::ConnectionTimeout { after: timeout });
                Some(Trigger::Timeout)
            }
        }
    }

    async fn record_failure(&mut self) -> Option<Trigger> {
        self.setup_deadline = None;
        self.close_transport().await;

        self.failures += 1;
        let failure = self.last_failure.take().unwrap_or(SessionError::Transport {
            reason: "unknown failure".to_string(),
        });
        warn!(
            "Session failure {}/{}: {}",
            self.failures, self.config.max_reconnect_attempts, failure
        );

        if self.failures >= self.config.max_reconnect_attempts {
            return Some(Trigger::RetriesExhausted);
        }

        // Content arriving during backoff belongs to the retry's setup cycle
        self.pending.begin_cycle(self.cycle + 1);

        self.emit_error(SessionErrorEvent::recoverable(failure));

        let delay = self.config.backoff(self.failures);
        self.metrics.record_reconnect_attempt();
        info!("Reconnecting in {:?}", delay);
        self.retry_at = Some(Instant::now() + delay);
        None
    }

    async fn close_transport(&mut self) {
        self.inbound = None;
        if let Err(e) = self.transport.close().await {
            warn!("Failed to close {} transport: {:#}", self.transport.name(), e);
        }
    }

    fn transport_fault(&mut self, e: anyhow::Error) -> Trigger {
        self.last_failure = Some(SessionError::Transport {
            reason: format!("{:#}", e),
        });
        Trigger::TransportFault
    }

    async fn fail(&mut self, trigger: Trigger, error: SessionError) {
        self.last_failure = Some(error);
        self.drive(trigger).await;
        self.last_failure = None;
    }

    async fn enqueue(&mut self, item: Outbound) {
        match self.state {
            SessionState::Active => {
                if let Err(e) = self.send_outbound(item).await {
                    let trigger = self.transport_fault(e);
                    self.drive(trigger).await;
                }
            }
            SessionState::SetupComplete => {
                self.pending.push(item);
                self.drive(Trigger::FirstTurn).await;
            }
            state if state.buffers_outbound() => {
                debug!("Buffering {} while {}", item.kind(), state);
                self.pending.push(item);
            }
            state => debug!("Dropping {} while {}", item.kind(), state),
        }
    }

    /// Send one content message. Only ever transmits while active.
    async fn send_outbound(&mut self, item: Outbound) -> Result<()> {
        if self.state != SessionState::Active {
            debug!("Not sending {} while {}", item.kind(), self.state);
            return Ok(());
        }

        let message = match item {
            Outbound::Insight(insight) => OutboundMessage::Insight(insight),
            Outbound::Context(context) => OutboundMessage::Context(context),
            Outbound::Audio { pcm, sample_rate } => {
                self.audio_sequence += 1;
                OutboundMessage::Audio(AudioPayload::new(&pcm, sample_rate, self.audio_sequence))
            }
        };

        self.transport.send(&message).await?;
        self.metrics.record_message_sent();
        Ok(())
    }

    async fn handle_inbound(&mut self, bytes: &[u8]) {
        let message: InboundMessage = match serde_json::from_slice(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed message from coaching service: {}", e);
                self.metrics.record_malformed_inbound();
                return;
            }
        };

        match message {
            InboundMessage::SetupComplete => self.drive(Trigger::SetupAck).await,

            InboundMessage::Transcription(transcription) => {
                self.accept_turn(InboundTurn::Transcription(transcription)).await
            }

            InboundMessage::Reply(reply) => self.accept_turn(InboundTurn::Reply(reply)).await,

            InboundMessage::Error(payload) if payload.fatal => {
                let error = if self.state == SessionState::SetupPending {
                    SessionError::SetupRejected {
                        reason: payload.message,
                    }
                } else {
                    SessionError::Service {
                        message: payload.message,
                    }
                };
                self.fail(Trigger::TransportFault, error).await;
            }

            InboundMessage::Error(payload) => {
                warn!("Coaching service error: {}", payload.message);
                self.emit_error(SessionErrorEvent::recoverable(SessionError::Service {
                    message: payload.message,
                }));
            }
        }
    }

    /// An inbound turn completes setup. Before that it waits in the buffer.
    async fn accept_turn(&mut self, turn: InboundTurn) {
        match self.state {
            SessionState::Active => self.deliver(turn),
            SessionState::SetupComplete => {
                self.pending.push_turn(turn);
                self.drive(Trigger::FirstTurn).await;
            }
            state if state.is_live() => {
                debug!("Buffering inbound turn while {}", state);
                self.pending.push_turn(turn);
            }
            state => debug!("Dropping inbound turn while {}", state),
        }
    }

    fn deliver(&mut self, turn: InboundTurn) {
        match turn {
            InboundTurn::Transcription(transcription) => {
                let _ = self.channels.transcriptions.send(transcription);
            }
            InboundTurn::Reply(reply) => {
                self.reply_in_progress = !reply.turn_complete;
                let _ = self.channels.replies.send(ReplyEvent::Text {
                    text: reply.text,
                    turn_complete: reply.turn_complete,
                });
            }
        }
    }

    async fn observe_speech(&mut self, level: f32, at: Instant) {
        if self.state != SessionState::Active {
            return;
        }
        if !self.barge_in.observe(level, at, self.reply_in_progress) {
            return;
        }

        info!("User started speaking, cancelling the current reply");
        let cancel = OutboundMessage::Cancel(CancelPayload {
            reason: "barge_in".to_string(),
            timestamp: Utc::now().to_rfc3339(),
        });

        match self.transport.send(&cancel).await {
            Ok(()) => {
                self.metrics.record_message_sent();
                self.reply_in_progress = false;
                let _ = self.channels.replies.send(ReplyEvent::Interrupted);
            }
            Err(e) => {
                let trigger = self.transport_fault(e);
                self.drive(trigger).await;
            }
        }
    }

    fn emit_error(&self, event: SessionErrorEvent) {
        if self.channels.errors.send(event).is_err() {
            debug!("No subscribers for session errors");
        }
    }
}

async fn next_frame(inbound: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
