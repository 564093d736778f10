//! Sample and analysis types shared by every stage of the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::{Duration, Instant};

/// One of the three live input channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Pose,
    Audio,
    Vision,
}

impl Modality {
    pub const ALL: [Modality; 3] = [Modality::Pose, Modality::Audio, Modality::Vision];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Pose => "pose",
            Modality::Audio => "audio",
            Modality::Vision => "vision",
        }
    }

    /// Position in per-modality arrays
    pub(crate) fn index(&self) -> usize {
        match self {
            Modality::Pose => 0,
            Modality::Audio => 1,
            Modality::Vision => 2,
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single body landmark in normalized image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    /// Depth relative to the hips (smaller is closer to the camera)
    pub z: f32,
    pub visibility: f32,
}

impl Landmark {
    pub fn new(x: f32, y: f32, z: f32, visibility: f32) -> Self {
        Self { x, y, z, visibility }
    }
}

/// Landmarks produced by the on-device pose estimator (33-point topology)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseLandmarks {
    pub landmarks: Vec<Landmark>,
}

impl PoseLandmarks {
    pub const NOSE: usize = 0;
    /// Last index of the facial landmark block (nose, eyes, ears, mouth)
    pub const FACE_LAST: usize = 10;
    pub const LEFT_SHOULDER: usize = 11;
    pub const RIGHT_SHOULDER: usize = 12;
    pub const LEFT_ELBOW: usize = 13;
    pub const RIGHT_ELBOW: usize = 14;
    pub const LEFT_WRIST: usize = 15;
    pub const RIGHT_WRIST: usize = 16;
    pub const LEFT_HIP: usize = 23;
    pub const RIGHT_HIP: usize = 24;
    pub const LEFT_KNEE: usize = 25;
    pub const RIGHT_KNEE: usize = 26;
    pub const LEFT_ANKLE: usize = 27;
    pub const RIGHT_ANKLE: usize = 28;
    pub const COUNT: usize = 33;

    pub fn new(landmarks: Vec<Landmark>) -> Self {
        Self { landmarks }
    }

    pub fn get(&self, index: usize) -> Option<&Landmark> {
        self.landmarks.get(index)
    }

    pub fn is_face(index: usize) -> bool {
        index <= Self::FACE_LAST
    }
}

/// A chunk of mono 16-bit PCM audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    /// Set when the privacy gate replaced the waveform with its envelope
    pub redacted: bool,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            redacted: false,
        }
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.samples.len() as u64 * 1_000_000 / self.sample_rate as u64)
    }
}

/// An 8-bit grayscale camera frame
#[derive(Debug, Clone, PartialEq)]
pub struct VisionFrame {
    pub width: u32,
    pub height: u32,
    /// Row-major luma, `width * height` bytes
    pub luma: Vec<u8>,
}

impl VisionFrame {
    pub fn new(width: u32, height: u32, luma: Vec<u8>) -> Self {
        Self { width, height, luma }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.luma.get((y * self.width + x) as usize).copied()
    }
}

/// Raw modality-specific payload handed to `submit`
#[derive(Debug, Clone, PartialEq)]
pub enum SamplePayload {
    Pose(PoseLandmarks),
    Audio(AudioChunk),
    Vision(VisionFrame),
}

impl SamplePayload {
    pub fn modality(&self) -> Modality {
        match self {
            SamplePayload::Pose(_) => Modality::Pose,
            SamplePayload::Audio(_) => Modality::Audio,
            SamplePayload::Vision(_) => Modality::Vision,
        }
    }
}

/// Whether the raw data behind a sample may leave the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Egress {
    LocalOnly,
    Anonymized,
    Cloud,
}

impl Egress {
    pub fn may_upload(&self) -> bool {
        !matches!(self, Egress::LocalOnly)
    }
}

/// One observation from one modality
#[derive(Debug, Clone)]
pub struct ModalitySample {
    pub modality: Modality,
    pub payload: SamplePayload,
    pub captured_at: Instant,
    pub confidence: f32,
    pub egress: Egress,
}

impl ModalitySample {
    pub fn new(payload: SamplePayload, confidence: f32) -> Self {
        Self::captured(payload, confidence, Instant::now())
    }

    pub fn captured(payload: SamplePayload, confidence: f32, captured_at: Instant) -> Self {
        Self {
            modality: payload.modality(),
            payload,
            captured_at,
            confidence: clamp_unit(confidence),
            egress: Egress::Cloud,
        }
    }

    /// Same sample with a replacement payload and egress (used by redaction)
    pub fn with_payload(&self, payload: SamplePayload, egress: Egress) -> Self {
        Self {
            modality: self.modality,
            payload,
            captured_at: self.captured_at,
            confidence: self.confidence,
            egress,
        }
    }
}

/// Category of an analyzer output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    FormAnalysis,
    SafetyAlert,
    SpeechActivity,
    Silence,
    SceneContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoseMetrics {
    pub landmarks: PoseLandmarks,
    pub knee_angle_deg: Option<f32>,
    pub hip_angle_deg: Option<f32>,
    pub elbow_angle_deg: Option<f32>,
    /// Vertical offset between shoulders, normalized units
    pub shoulder_tilt: Option<f32>,
    pub mean_visibility: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioFeatures {
    /// RMS level normalized to [0, 1]
    pub level: f32,
    pub zero_crossing_rate: f32,
    pub speech_active: bool,
    pub duration_ms: u64,
    pub sample_rate: u32,
    #[serde(skip)]
    pub pcm: Option<Vec<i16>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneFeatures {
    /// Mean luma normalized to [0, 1]
    pub brightness: f32,
    pub contrast: f32,
    pub person_visible: bool,
    pub label: Option<String>,
}

/// Modality-specific analysis record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisData {
    Pose(PoseMetrics),
    Audio(AudioFeatures),
    Vision(SceneFeatures),
}

/// Output of an analyzer for one sample
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub id: String,
    pub modality: Modality,
    pub result_type: ResultType,
    pub confidence: f32,
    pub data: AnalysisData,
    pub produced_at: DateTime<Utc>,
    pub egress: Egress,
    #[serde(skip)]
    pub captured_at: Instant,
    #[serde(skip)]
    pub completed_at: Instant,
}

impl AnalysisResult {
    /// Build a result for `sample`, inheriting its confidence, capture time and egress
    pub fn for_sample(sample: &ModalitySample, result_type: ResultType, data: AnalysisData) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            modality: sample.modality,
            result_type,
            confidence: sample.confidence,
            data,
            produced_at: Utc::now(),
            egress: sample.egress,
            captured_at: sample.captured_at,
            completed_at: Instant::now(),
        }
    }

    /// Capture-to-result latency
    pub fn latency(&self) -> Duration {
        self.completed_at.saturating_duration_since(self.captured_at)
    }

    pub fn speech_level(&self) -> Option<f32> {
        match &self.data {
            AnalysisData::Audio(features) => Some(features.level),
            _ => None,
        }
    }
}

pub(crate) fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
