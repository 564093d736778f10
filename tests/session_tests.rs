// Integration tests for the session state machine
//
// A scripted in-memory transport stands in for the coaching service so the
// tests can hold the handshake, acknowledge setup, and inject replies.

mod common;

use anyhow::Result;
use common::{
    collect_states, fast_session_config, next_event, pose_result, spawn_session, wait_until,
    OpenBehavior,
};
use pose_coach::error::{ErrorSeverity, SessionError, COACHING_UNAVAILABLE};
use pose_coach::fusion::FusedInsight;
use pose_coach::session::{ReplyEvent, SessionConfig, SessionState};
use pose_coach::transport::OutboundMessage;
use std::time::Duration;
use tokio::time::Instant;

fn insight() -> FusedInsight {
    FusedInsight {
        id: "insight-1".to_string(),
        contributing_modalities: Default::default(),
        confidence: 0.8,
        recommendations: Vec::new(),
        produced_at: chrono::Utc::now(),
    }
}

/// Fast timers, but enough setup time for the test to acknowledge by hand
fn patient_setup() -> SessionConfig {
    SessionConfig {
        setup_timeout_ms: 5000,
        ..fast_session_config()
    }
}

#[tokio::test]
async fn test_handshake_timeouts_settle_disconnected() -> Result<()> {
    let session = spawn_session(OpenBehavior::Hang, fast_session_config());
    let mut states = session.handle.subscribe_states();
    let mut errors = session.handle.subscribe_errors();

    session.handle.connect()?;

    let observed = collect_states(&mut states, SessionState::Disconnected).await?;
    assert_eq!(
        observed,
        vec![
            SessionState::Connecting,
            SessionState::Error,
            SessionState::Connecting,
            SessionState::Error,
            SessionState::Connecting,
            SessionState::Error,
            SessionState::Disconnected,
        ]
    );

    let first = next_event(&mut errors).await?;
    assert_eq!(first.severity, ErrorSeverity::RecoverableSession);
    assert!(matches!(first.error, SessionError::ConnectionTimeout { .. }));

    let second = next_event(&mut errors).await?;
    assert!(matches!(second.error, SessionError::ConnectionTimeout { .. }));

    let last = next_event(&mut errors).await?;
    assert!(last.is_fatal());
    assert_eq!(last.message, COACHING_UNAVAILABLE);

    // No fourth attempt
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.probe.opens(), 3);
    assert_eq!(session.handle.state(), SessionState::Disconnected);

    Ok(())
}

#[tokio::test]
async fn test_failed_opens_give_up_after_three_attempts() -> Result<()> {
    let session = spawn_session(OpenBehavior::Fail, fast_session_config());
    let mut errors = session.handle.subscribe_errors();

    session.handle.connect()?;

    let mut fatal = None;
    for _ in 0..3 {
        let event = next_event(&mut errors).await?;
        if event.is_fatal() {
            fatal = Some(event);
            break;
        }
    }

    let fatal = fatal.expect("expected a fatal error");
    assert_eq!(fatal.error, SessionError::ReconnectExhausted { attempts: 3 });

    session
        .handle
        .wait_for_state(SessionState::Disconnected, Duration::from_secs(1))
        .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.probe.opens(), 3);
    assert_eq!(session.metrics.snapshot().reconnect_attempts, 2);

    Ok(())
}

#[tokio::test]
async fn test_content_waits_for_active() -> Result<()> {
    let session = spawn_session(OpenBehavior::Accept { auto_ack: false }, patient_setup());

    session.handle.connect()?;
    session
        .handle
        .wait_for_state(SessionState::SetupPending, Duration::from_secs(1))
        .await?;

    session.handle.send_insight(insight());
    session.handle.send_context(pose_result(0.9));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.probe.sent_kinds(), vec!["setup"]);

    session.probe.push(r#"{"type":"setup_complete"}"#).await?;
    session
        .handle
        .wait_for_state(SessionState::Active, Duration::from_secs(1))
        .await?;
    session.probe.wait_for_sent("context", 1).await?;

    assert_eq!(session.probe.sent_kinds(), vec!["setup", "insight", "context"]);

    Ok(())
}

#[tokio::test]
async fn test_only_latest_pose_context_is_buffered() -> Result<()> {
    let session = spawn_session(OpenBehavior::Accept { auto_ack: false }, patient_setup());

    session.handle.connect()?;
    session
        .handle
        .wait_for_state(SessionState::SetupPending, Duration::from_secs(1))
        .await?;

    let older = pose_result(0.5);
    let newer = pose_result(0.9);
    let newer_id = newer.id.clone();
    session.handle.send_context(older);
    session.handle.send_context(newer);

    session.probe.push(r#"{"type":"setup_complete"}"#).await?;
    session.probe.wait_for_sent("context", 1).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let contexts: Vec<String> = session
        .probe
        .sent()
        .into_iter()
        .filter_map(|m| match m {
            OutboundMessage::Context(c) => Some(c.analysis_id),
            _ => None,
        })
        .collect();
    assert_eq!(contexts, vec![newer_id]);

    Ok(())
}

#[tokio::test]
async fn test_setup_timeout_drops_stale_buffer() -> Result<()> {
    let session = spawn_session(OpenBehavior::Accept { auto_ack: false }, fast_session_config());
    let mut states = session.handle.subscribe_states();

    session.handle.connect()?;
    session
        .handle
        .wait_for_state(SessionState::SetupPending, Duration::from_secs(1))
        .await?;
    session.handle.send_insight(insight());

    // Setup is never acknowledged: times out and reconnects
    let observed = collect_states(&mut states, SessionState::Error).await?;
    assert_eq!(observed.last(), Some(&SessionState::Error));
    session.probe.wait_for_sent("setup", 2).await?;
    session
        .handle
        .wait_for_state(SessionState::SetupPending, Duration::from_secs(1))
        .await?;

    session.probe.push(r#"{"type":"setup_complete"}"#).await?;
    session
        .handle
        .wait_for_state(SessionState::SetupComplete, Duration::from_secs(1))
        .await?;

    // The insight belonged to the first setup cycle
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.probe.count("insight"), 0);
    assert_eq!(session.handle.state(), SessionState::SetupComplete);
    assert_eq!(session.probe.opens(), 2);

    Ok(())
}

#[tokio::test]
async fn test_content_sent_during_backoff_waits_for_next_cycle() -> Result<()> {
    let config = SessionConfig {
        setup_timeout_ms: 200,
        backoff_base_ms: 400,
        backoff_max_ms: 400,
        ..fast_session_config()
    };
    let session = spawn_session(OpenBehavior::Accept { auto_ack: false }, config);

    session.handle.connect()?;
    session
        .handle
        .wait_for_state(SessionState::Error, Duration::from_secs(1))
        .await?;

    // Sent while waiting to retry
    session.handle.send_insight(insight());

    session.probe.wait_for_sent("setup", 2).await?;
    session
        .handle
        .wait_for_state(SessionState::SetupPending, Duration::from_secs(1))
        .await?;
    session.probe.push(r#"{"type":"setup_complete"}"#).await?;

    session
        .handle
        .wait_for_state(SessionState::Active, Duration::from_secs(1))
        .await?;
    session.probe.wait_for_sent("insight", 1).await?;
    assert_eq!(session.probe.sent_kinds(), vec!["setup", "setup", "insight"]);

    Ok(())
}

#[tokio::test]
async fn test_unsent_content_survives_failed_flush() -> Result<()> {
    let session = spawn_session(OpenBehavior::Accept { auto_ack: false }, patient_setup());

    session.handle.connect()?;
    session
        .handle
        .wait_for_state(SessionState::SetupPending, Duration::from_secs(1))
        .await?;
    session.handle.send_insight(insight());
    session.handle.send_context(pose_result(0.9));

    session.probe.fail_next_send("insight");
    session.probe.push(r#"{"type":"setup_complete"}"#).await?;

    // The flush fails on the first item and the session reconnects
    session.probe.wait_for_sent("setup", 2).await?;
    session
        .handle
        .wait_for_state(SessionState::SetupPending, Duration::from_secs(1))
        .await?;
    assert_eq!(session.probe.count("insight"), 0);

    session.probe.push(r#"{"type":"setup_complete"}"#).await?;
    session
        .handle
        .wait_for_state(SessionState::Active, Duration::from_secs(1))
        .await?;
    session.probe.wait_for_sent("context", 1).await?;
    assert_eq!(
        session.probe.sent_kinds(),
        vec!["setup", "setup", "insight", "context"]
    );

    Ok(())
}

#[tokio::test]
async fn test_turn_before_setup_ack_is_delivered_once_active() -> Result<()> {
    let session = spawn_session(OpenBehavior::Accept { auto_ack: false }, patient_setup());
    let mut transcriptions = session.handle.subscribe_transcriptions();

    session.handle.connect()?;
    session
        .handle
        .wait_for_state(SessionState::SetupPending, Duration::from_secs(1))
        .await?;

    session
        .probe
        .push(r#"{"type":"transcription","payload":{"text":"is my back straight?"}}"#)
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(transcriptions.try_recv().is_err());
    assert_eq!(session.handle.state(), SessionState::SetupPending);

    session.probe.push(r#"{"type":"setup_complete"}"#).await?;

    let transcription = next_event(&mut transcriptions).await?;
    assert_eq!(transcription.text, "is my back straight?");
    assert_eq!(session.handle.state(), SessionState::Active);

    Ok(())
}

#[tokio::test]
async fn test_turn_from_timed_out_cycle_is_dropped() -> Result<()> {
    let session = spawn_session(OpenBehavior::Accept { auto_ack: false }, fast_session_config());
    let mut transcriptions = session.handle.subscribe_transcriptions();

    session.handle.connect()?;
    session
        .handle
        .wait_for_state(SessionState::SetupPending, Duration::from_secs(1))
        .await?;
    session
        .probe
        .push(r#"{"type":"transcription","payload":{"text":"hello?"}}"#)
        .await?;

    // Setup times out; the retry's cycle starts empty
    session.probe.wait_for_sent("setup", 2).await?;
    session
        .handle
        .wait_for_state(SessionState::SetupPending, Duration::from_secs(1))
        .await?;
    session.probe.push(r#"{"type":"setup_complete"}"#).await?;
    session
        .handle
        .wait_for_state(SessionState::SetupComplete, Duration::from_secs(1))
        .await?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(transcriptions.try_recv().is_err());
    assert_eq!(session.handle.state(), SessionState::SetupComplete);

    Ok(())
}

#[tokio::test]
async fn test_inbound_turn_activates_session() -> Result<()> {
    let session = spawn_session(OpenBehavior::Accept { auto_ack: true }, fast_session_config());
    let mut transcriptions = session.handle.subscribe_transcriptions();

    session.handle.connect()?;
    session
        .handle
        .wait_for_state(SessionState::SetupComplete, Duration::from_secs(1))
        .await?;

    session
        .probe
        .push(r#"{"type":"transcription","payload":{"text":"ready when you are"}}"#)
        .await?;

    let transcription = next_event(&mut transcriptions).await?;
    assert_eq!(transcription.text, "ready when you are");
    assert_eq!(session.handle.state(), SessionState::Active);

    Ok(())
}

#[tokio::test]
async fn test_malformed_message_is_counted_and_ignored() -> Result<()> {
    let session = spawn_session(OpenBehavior::Accept { auto_ack: true }, fast_session_config());
    let mut replies = session.handle.subscribe_replies();

    session.handle.connect()?;
    session.handle.send_insight(insight());
    session
        .handle
        .wait_for_state(SessionState::Active, Duration::from_secs(1))
        .await?;

    session.probe.push("{not json").await?;
    session.probe.push(r#"{"type":"mystery","payload":{}}"#).await?;
    session
        .probe
        .push(r#"{"type":"reply","payload":{"text":"Nice depth","turn_complete":true}}"#)
        .await?;

    let reply = next_event(&mut replies).await?;
    assert_eq!(
        reply,
        ReplyEvent::Text {
            text: "Nice depth".to_string(),
            turn_complete: true
        }
    );
    assert_eq!(session.metrics.snapshot().malformed_inbound, 2);
    assert_eq!(session.handle.state(), SessionState::Active);

    Ok(())
}

#[tokio::test]
async fn test_barge_in_sends_single_cancel() -> Result<()> {
    let session = spawn_session(OpenBehavior::Accept { auto_ack: true }, fast_session_config());
    let mut replies = session.handle.subscribe_replies();

    session.handle.connect()?;
    session
        .handle
        .wait_for_state(SessionState::SetupComplete, Duration::from_secs(1))
        .await?;

    session
        .probe
        .push(r#"{"type":"reply","payload":{"text":"Lower your hips and","turn_complete":false}}"#)
        .await?;
    assert!(matches!(next_event(&mut replies).await?, ReplyEvent::Text { .. }));

    let t0 = Instant::now();
    for offset in [0, 100, 250, 300, 600, 900] {
        session
            .handle
            .report_speech_activity(0.5, t0 + Duration::from_millis(offset));
    }

    assert_eq!(next_event(&mut replies).await?, ReplyEvent::Interrupted);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.probe.count("cancel"), 1);

    Ok(())
}

#[tokio::test]
async fn test_quiet_user_never_interrupts() -> Result<()> {
    let session = spawn_session(OpenBehavior::Accept { auto_ack: true }, fast_session_config());
    let mut replies = session.handle.subscribe_replies();

    session.handle.connect()?;
    session
        .handle
        .wait_for_state(SessionState::SetupComplete, Duration::from_secs(1))
        .await?;
    session
        .probe
        .push(r#"{"type":"reply","payload":{"text":"Good","turn_complete":false}}"#)
        .await?;
    next_event(&mut replies).await?;

    let t0 = Instant::now();
    for offset in (0..10).map(|i| i * 100) {
        session
            .handle
            .report_speech_activity(0.01, t0 + Duration::from_millis(offset));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.probe.count("cancel"), 0);

    Ok(())
}

#[tokio::test]
async fn test_service_errors() -> Result<()> {
    let session = spawn_session(OpenBehavior::Accept { auto_ack: true }, fast_session_config());
    let mut errors = session.handle.subscribe_errors();

    session.handle.connect()?;
    session.handle.send_insight(insight());
    session
        .handle
        .wait_for_state(SessionState::Active, Duration::from_secs(1))
        .await?;

    // Non-fatal: surfaced, no state change
    session
        .probe
        .push(r#"{"type":"error","payload":{"message":"slow down"}}"#)
        .await?;
    let event = next_event(&mut errors).await?;
    assert_eq!(event.severity, ErrorSeverity::RecoverableSession);
    assert_eq!(
        event.error,
        SessionError::Service {
            message: "slow down".to_string()
        }
    );
    assert_eq!(session.handle.state(), SessionState::Active);

    // Fatal: treated as a transport fault and reconnected
    session
        .probe
        .push(r#"{"type":"error","payload":{"message":"stream reset","fatal":true}}"#)
        .await?;
    let event = next_event(&mut errors).await?;
    assert!(!event.is_fatal());
    wait_until(|| session.probe.opens() == 2).await?;
    session
        .handle
        .wait_for_state(SessionState::SetupComplete, Duration::from_secs(1))
        .await?;

    Ok(())
}

#[tokio::test]
async fn test_recovered_failures_never_exhaust_budget() -> Result<()> {
    let session = spawn_session(OpenBehavior::Accept { auto_ack: true }, fast_session_config());
    let mut states = session.handle.subscribe_states();
    let mut errors = session.handle.subscribe_errors();

    session.handle.connect()?;
    session
        .handle
        .wait_for_state(SessionState::SetupComplete, Duration::from_secs(1))
        .await?;

    // Each fault is followed by a successful setup, so none are consecutive
    for cycle in 1..=4 {
        session
            .probe
            .push(r#"{"type":"error","payload":{"message":"stream reset","fatal":true}}"#)
            .await?;
        wait_until(|| session.probe.opens() == cycle + 1).await?;
        session
            .handle
            .wait_for_state(SessionState::SetupComplete, Duration::from_secs(1))
            .await?;
    }

    let mut observed = Vec::new();
    while let Ok(state) = states.try_recv() {
        observed.push(state);
    }
    assert!(!observed.contains(&SessionState::Disconnected));
    assert_eq!(
        observed.iter().filter(|s| **s == SessionState::Error).count(),
        4
    );

    let mut recoverable = 0;
    while let Ok(event) = errors.try_recv() {
        assert!(!event.is_fatal(), "unexpected fatal error: {}", event.message);
        recoverable += 1;
    }
    assert_eq!(recoverable, 4);
    assert_eq!(session.handle.state(), SessionState::SetupComplete);

    Ok(())
}

#[tokio::test]
async fn test_disconnect_drops_later_content() -> Result<()> {
    let session = spawn_session(OpenBehavior::Accept { auto_ack: true }, fast_session_config());
    let mut states = session.handle.subscribe_states();

    session.handle.connect()?;
    session.handle.send_insight(insight());
    session
        .handle
        .wait_for_state(SessionState::Active, Duration::from_secs(1))
        .await?;

    session.handle.disconnect()?;
    let observed = collect_states(&mut states, SessionState::Disconnected).await?;
    assert_eq!(
        &observed[observed.len() - 2..],
        &[SessionState::Disconnecting, SessionState::Disconnected]
    );

    let sent_before = session.probe.sent().len();
    session.handle.send_insight(insight());
    session.handle.send_context(pose_result(0.9));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.probe.sent().len(), sent_before);

    Ok(())
}

#[tokio::test]
async fn test_local_only_context_stays_on_device() -> Result<()> {
    let session = spawn_session(OpenBehavior::Accept { auto_ack: true }, fast_session_config());

    session.handle.connect()?;
    session.handle.send_insight(insight());
    session
        .handle
        .wait_for_state(SessionState::Active, Duration::from_secs(1))
        .await?;

    let mut local = pose_result(0.9);
    local.egress = pose_coach::modality::Egress::LocalOnly;
    session.handle.send_context(local);
    session.handle.send_context(pose_result(0.9));

    session.probe.wait_for_sent("context", 1).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.probe.count("context"), 1);

    Ok(())
}
