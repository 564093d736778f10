//! Duplex channel to the remote coaching service

pub mod messages;
pub mod nats;

pub use messages::{
    AudioPayload, CancelPayload, ContextPayload, InboundMessage, OutboundMessage, ReplyPayload,
    ServiceErrorPayload, SetupPayload, TranscriptionPayload,
};
pub use nats::NatsTransport;

use anyhow::Result;
use serde::Deserialize;
use tokio::sync::mpsc;

/// Connection settings for the coaching service
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Server URL
    pub url: String,
    /// Subject prefix; frames flow on `{prefix}.{session}.out` / `.in`
    pub subject_prefix: String,
    /// Model requested in the setup message
    pub model: String,
    /// System instructions sent with setup
    pub instructions: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            subject_prefix: "coach".to_string(),
            model: "coach-live".to_string(),
            instructions: "You are a concise exercise coach. Keep feedback short and actionable."
                .to_string(),
        }
    }
}

/// Abstract duplex channel to the coaching service
///
/// Implementations:
/// - `NatsTransport`: request/response subjects on a NATS server
/// - test doubles scripting handshakes, faults and replies
#[async_trait::async_trait]
pub trait CoachingTransport: Send {
    /// Open the channel (performs the handshake)
    ///
    /// Returns a receiver of raw inbound frames; it closes when the remote side does.
    async fn open(&mut self, config: &TransportConfig) -> Result<mpsc::Receiver<Vec<u8>>>;

    /// Send one envelope
    async fn send(&mut self, message: &OutboundMessage) -> Result<()>;

    /// Close the channel
    async fn close(&mut self) -> Result<()>;

    /// Transport name for logging
    fn name(&self) -> &str;
}
