// Shared fixtures for the integration tests: a scripted in-memory transport
// and sample builders.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use pose_coach::modality::{
    AnalysisData, AnalysisResult, AudioChunk, Landmark, ModalitySample, PoseLandmarks,
    PoseMetrics, ResultType, SamplePayload,
};
use pose_coach::session::{SessionConfig, SessionHandle, SessionState};
use pose_coach::transport::{CoachingTransport, OutboundMessage, TransportConfig};
use pose_coach::MetricsAggregator;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpenBehavior {
    /// Handshake succeeds; optionally acknowledge setup automatically
    Accept { auto_ack: bool },
    /// Handshake fails immediately
    Fail,
    /// Handshake never completes
    Hang,
}

/// In-memory coaching service
pub struct ScriptedTransport {
    probe: TransportProbe,
}

/// Test-side view of a `ScriptedTransport`
#[derive(Clone)]
pub struct TransportProbe {
    behavior: Arc<Mutex<OpenBehavior>>,
    opens: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
    inbound: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    fail_next: Arc<Mutex<Option<&'static str>>>,
}

impl ScriptedTransport {
    pub fn new(behavior: OpenBehavior) -> (Self, TransportProbe) {
        let probe = TransportProbe {
            behavior: Arc::new(Mutex::new(behavior)),
            opens: Default::default(),
            sent: Default::default(),
            inbound: Default::default(),
            fail_next: Default::default(),
        };
        (
            Self {
                probe: probe.clone(),
            },
            probe,
        )
    }

    fn behavior(&self) -> OpenBehavior {
        *self.probe.behavior.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl CoachingTransport for ScriptedTransport {
    async fn open(&mut self, _config: &TransportConfig) -> Result<mpsc::Receiver<Vec<u8>>> {
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        match self.behavior() {
            OpenBehavior::Fail => Err(anyhow!("connection refused")),
            OpenBehavior::Hang => std::future::pending().await,
            OpenBehavior::Accept { .. } => {
                let (tx, rx) = mpsc::channel(32);
                *self.probe.inbound.lock().unwrap() = Some(tx);
                Ok(rx)
            }
        }
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<()> {
        {
            let mut fail_next = self.probe.fail_next.lock().unwrap();
            if *fail_next == Some(message.kind()) {
                *fail_next = None;
                return Err(anyhow!("broken pipe while sending {}", message.kind()));
            }
        }
        self.probe.sent.lock().unwrap().push(message.clone());

        if let (OutboundMessage::Setup(_), OpenBehavior::Accept { auto_ack: true }) =
            (message, self.behavior())
        {
            let tx = self.probe.inbound.lock().unwrap().clone();
            if let Some(tx) = tx {
                tx.send(br#"{"type":"setup_complete"}"#.to_vec()).await?;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.probe.inbound.lock().unwrap().take();
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

impl TransportProbe {
    /// Change how later connection attempts behave
    pub fn set_behavior(&self, behavior: OpenBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Make the next send of `kind` fail
    pub fn fail_next_send(&self, kind: &'static str) {
        *self.fail_next.lock().unwrap() = Some(kind);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent().iter().map(|m| m.kind()).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.sent_kinds().iter().filter(|k| **k == kind).count()
    }

    /// Deliver a raw frame as if the service had sent it
    pub async fn push(&self, frame: &str) -> Result<()> {
        let tx = self
            .inbound
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("transport is not open"))?;
        tx.send(frame.as_bytes().to_vec()).await?;
        Ok(())
    }

    /// Wait until at least `count` messages of `kind` have been sent
    pub async fn wait_for_sent(&self, kind: &str, count: usize) -> Result<()> {
        wait_until(|| self.count(kind) >= count)
            .await
            .map_err(|_| anyhow!("expected {} {} messages, sent {:?}", count, kind, self.sent_kinds()))
    }
}

/// Poll `condition` every 10ms for up to 3s
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("condition not met within 3s"))
}

/// Session settings with short timers
pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        session_id: "test-session".to_string(),
        handshake_timeout_ms: 50,
        setup_timeout_ms: 100,
        backoff_base_ms: 10,
        backoff_max_ms: 40,
        ..Default::default()
    }
}

pub struct TestSession {
    pub handle: SessionHandle,
    pub probe: TransportProbe,
    pub metrics: Arc<MetricsAggregator>,
    pub cancel: CancellationToken,
}

pub fn spawn_session(behavior: OpenBehavior, config: SessionConfig) -> TestSession {
    let (transport, probe) = ScriptedTransport::new(behavior);
    let metrics = Arc::new(MetricsAggregator::default());
    let cancel = CancellationToken::new();
    let (handle, _task) = SessionHandle::spawn(
        config,
        TransportConfig::default(),
        Box::new(transport),
        Arc::clone(&metrics),
        cancel.clone(),
    );

    TestSession {
        handle,
        probe,
        metrics,
        cancel,
    }
}

/// Receive state changes until `last` (inclusive)
pub async fn collect_states(
    rx: &mut broadcast::Receiver<SessionState>,
    last: SessionState,
) -> Result<Vec<SessionState>> {
    let mut states = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let state = rx.recv().await?;
            states.push(state);
            if state == last {
                return Ok::<_, anyhow::Error>(());
            }
        }
    })
    .await
    .map_err(|_| anyhow!("never reached {:?}, saw {:?}", last, states))??;
    Ok(states)
}

/// Next item from a broadcast stream, failing after 3s
pub async fn next_event<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Result<T> {
    Ok(tokio::time::timeout(Duration::from_secs(3), rx.recv()).await??)
}

/// Standing pose with every landmark visible
pub fn standing_pose() -> PoseLandmarks {
    let mut landmarks = vec![Landmark::new(0.5, 0.1, 0.0, 0.9); PoseLandmarks::COUNT];
    let mut set = |i: usize, x: f32, y: f32| landmarks[i] = Landmark::new(x, y, -0.1, 0.95);
    set(PoseLandmarks::LEFT_SHOULDER, 0.45, 0.30);
    set(PoseLandmarks::RIGHT_SHOULDER, 0.55, 0.30);
    set(PoseLandmarks::LEFT_ELBOW, 0.43, 0.42);
    set(PoseLandmarks::RIGHT_ELBOW, 0.57, 0.42);
    set(PoseLandmarks::LEFT_WRIST, 0.42, 0.52);
    set(PoseLandmarks::RIGHT_WRIST, 0.58, 0.52);
    set(PoseLandmarks::LEFT_HIP, 0.47, 0.55);
    set(PoseLandmarks::RIGHT_HIP, 0.53, 0.55);
    set(PoseLandmarks::LEFT_KNEE, 0.47, 0.72);
    set(PoseLandmarks::RIGHT_KNEE, 0.53, 0.72);
    set(PoseLandmarks::LEFT_ANKLE, 0.47, 0.90);
    set(PoseLandmarks::RIGHT_ANKLE, 0.53, 0.90);
    PoseLandmarks::new(landmarks)
}

/// 100ms of a loud 440Hz tone at 16kHz
pub fn loud_audio() -> AudioChunk {
    let samples = (0..1600)
        .map(|i| {
            let t = i as f32 / 16000.0;
            ((t * 440.0 * std::f32::consts::TAU).sin() * 12000.0) as i16
        })
        .collect();
    AudioChunk::new(samples, 16000)
}

/// A pose form-analysis result, as the pipeline would publish it
pub fn pose_result(confidence: f32) -> AnalysisResult {
    let pose = standing_pose();
    let sample = ModalitySample::new(SamplePayload::Pose(pose.clone()), confidence);
    AnalysisResult::for_sample(
        &sample,
        ResultType::FormAnalysis,
        AnalysisData::Pose(PoseMetrics {
            landmarks: pose,
            knee_angle_deg: Some(175.0),
            hip_angle_deg: Some(178.0),
            elbow_angle_deg: Some(170.0),
            shoulder_tilt: Some(0.0),
            mean_visibility: 0.93,
        }),
    )
}
