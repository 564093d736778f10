use anyhow::{Context, Result};
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::fusion::FusedInsight;
use crate::modality::{Modality, ResultType};

/// Envelope sent to the coaching service: `{"type": ..., "payload": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundMessage {
    Setup(SetupPayload),
    Context(ContextPayload),
    Insight(FusedInsight),
    Audio(AudioPayload),
    Cancel(CancelPayload),
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Setup(_) => "setup",
            OutboundMessage::Context(_) => "context",
            OutboundMessage::Insight(_) => "insight",
            OutboundMessage::Audio(_) => "audio",
            OutboundMessage::Cancel(_) => "cancel",
        }
    }
}

/// Session negotiation, sent once per setup cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupPayload {
    pub session_id: String,
    pub model: String,
    pub instructions: String,
    pub modalities: Vec<Modality>,
}

/// Continuous per-frame context (pose updates)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPayload {
    pub analysis_id: String,
    pub modality: Modality,
    pub result_type: ResultType,
    pub confidence: f32,
    pub data: serde_json::Value,
    pub timestamp: String, // RFC3339 timestamp
}

/// Realtime microphone input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioPayload {
    pub pcm: String, // Base64-encoded i16 little-endian PCM
    pub sample_rate: u32,
    pub sequence: u64,
    pub timestamp: String,
}

impl AudioPayload {
    pub fn new(pcm: &[i16], sample_rate: u32, sequence: u64) -> Self {
        let pcm_bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self {
            pcm: base64::engine::general_purpose::STANDARD.encode(pcm_bytes),
            sample_rate,
            sequence,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Decode the PCM samples
    pub fn samples(&self) -> Result<Vec<i16>> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.pcm)
            .context("Invalid base64 audio payload")?;
        if bytes.len() % 2 != 0 {
            anyhow::bail!("Audio payload has an odd byte count ({})", bytes.len());
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }
}

/// Barge-in: stop the reply currently being produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelPayload {
    pub reason: String,
    pub timestamp: String,
}

/// Envelope received from the coaching service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Setup acknowledgement; carries no payload
    SetupComplete,
    Transcription(TranscriptionPayload),
    Reply(ReplyPayload),
    Error(ServiceErrorPayload),
}

/// Transcript of the user's speech
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionPayload {
    pub text: String,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// A piece of the coach's reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub text: String,
    /// Set on the last piece of a reply
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceErrorPayload {
    pub message: String,
    #[serde(default)]
    pub fatal: bool,
}
