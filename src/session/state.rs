//! Session lifecycle as an explicit transition table

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    SetupPending,
    SetupComplete,
    Active,
    Disconnecting,
    Error,
}

impl SessionState {
    /// States in which the transport is (or is being) established
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::Connected
                | SessionState::SetupPending
                | SessionState::SetupComplete
                | SessionState::Active
        )
    }

    /// States in which outbound messages are held rather than dropped
    pub fn buffers_outbound(&self) -> bool {
        self.is_live() || *self == SessionState::Error
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Connect,
    HandshakeOk,
    SetupSent,
    SetupAck,
    FirstTurn,
    Timeout,
    TransportFault,
    Retry,
    RetriesExhausted,
    Disconnect,
    Closed,
}

/// Side effect performed by the session task after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    OpenTransport,
    SendSetup,
    ArmSetupTimer,
    ResetFailures,
    FlushBuffered,
    RecordFailure,
    GiveUp,
    CloseTransport,
    DropBuffers,
}

/// Look up `(state, trigger)`. `None` means the trigger is ignored in that state.
pub fn transition(state: SessionState, trigger: Trigger) -> Option<(SessionState, Effect)> {
    use Effect::*;
    use SessionState::*;

    let next = match (state, trigger) {
        (Disconnected, Trigger::Connect) => (Connecting, OpenTransport),
        (Connecting, Trigger::HandshakeOk) => (Connected, SendSetup),
        (Connected, Trigger::SetupSent) => (SetupPending, ArmSetupTimer),
        (SetupPending, Trigger::SetupAck) => (SetupComplete, ResetFailures),
        (SetupComplete, Trigger::FirstTurn) => (Active, FlushBuffered),

        (Connecting | SetupPending, Trigger::Timeout) => (Error, RecordFailure),
        (s, Trigger::TransportFault) if s.is_live() => (Error, RecordFailure),

        (Error, Trigger::Retry) => (Connecting, OpenTransport),
        (Error, Trigger::RetriesExhausted) => (Disconnected, GiveUp),

        (s, Trigger::Disconnect) if s != Disconnected && s != Disconnecting => {
            (Disconnecting, CloseTransport)
        }
        (Disconnecting, Trigger::Closed) => (Disconnected, DropBuffers),

        _ => return None,
    };

    Some(next)
}
