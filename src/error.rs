//! Error types for the coaching engine

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::modality::Modality;

/// User-facing text for fatal session failures
pub const COACHING_UNAVAILABLE: &str = "Coaching temporarily unavailable";

/// Failures of a single analyzer invocation. Never escape the pipeline worker.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("{modality} analyzer timed out after {after:?}")]
    Timeout { modality: Modality, after: Duration },

    #[error("{modality} analyzer failed: {reason}")]
    Failed { modality: Modality, reason: String },

    #[error("{modality} analyzer panicked")]
    Panicked { modality: Modality },

    #[error("expected a {expected} payload, got {actual}")]
    PayloadMismatch { expected: Modality, actual: Modality },
}

/// Session-level failures, surfaced on the error event stream
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionError {
    #[error("connection timed out after {after:?}")]
    ConnectionTimeout { after: Duration },

    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("coaching service rejected setup: {reason}")]
    SetupRejected { reason: String },

    #[error("coaching service reported: {message}")]
    Service { message: String },

    #[error("reconnect budget exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

/// Where an error sits in the recovery taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Logged and counted, processing continues
    RecoverableLocal,
    /// Triggers the reconnect path, shown as a non-fatal status
    RecoverableSession,
    /// Session forced to `Disconnected`
    Fatal,
}

/// Entry on the session error stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionErrorEvent {
    pub severity: ErrorSeverity,
    pub error: SessionError,
    /// Text safe to show the user
    pub message: String,
}

impl SessionErrorEvent {
    pub fn recoverable(error: SessionError) -> Self {
        let message = match &error {
            SessionError::Service { message } => message.clone(),
            _ => "Reconnecting to coach".to_string(),
        };
        Self {
            severity: ErrorSeverity::RecoverableSession,
            error,
            message,
        }
    }

    pub fn fatal(error: SessionError) -> Self {
        Self {
            severity: ErrorSeverity::Fatal,
            error,
            message: COACHING_UNAVAILABLE.to_string(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == ErrorSeverity::Fatal
    }
}
