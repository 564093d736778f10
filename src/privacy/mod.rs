//! Privacy gate
//!
//! Decides, per modality and per user-configured level, whether a sample may
//! proceed unchanged, must be redacted first, or must be dropped. The gate is
//! a pure function of the sample and the policy snapshot: no I/O, no state.

mod consent;

pub use consent::{ConsentStore, SharedConsentStore};

use serde::{Deserialize, Serialize};

use crate::modality::{
    AudioChunk, Egress, Modality, ModalitySample, PoseLandmarks, SamplePayload, VisionFrame,
};

/// Edge length of the pixelation blocks used for vision redaction
const VISION_BLOCK: u32 = 16;

/// Envelope window for audio redaction (10 ms)
const AUDIO_ENVELOPE_WINDOWS_PER_SEC: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    Blocked,
    LocalOnly,
    Anonymized,
    CloudAllowed,
}

/// Per-modality permission levels. A missing entry means the modality is
/// treated as blocked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrivacyPolicy {
    #[serde(default)]
    pub pose: Option<PrivacyLevel>,
    #[serde(default)]
    pub audio: Option<PrivacyLevel>,
    #[serde(default)]
    pub vision: Option<PrivacyLevel>,
}

impl PrivacyPolicy {
    pub fn uniform(level: PrivacyLevel) -> Self {
        Self {
            pose: Some(level),
            audio: Some(level),
            vision: Some(level),
        }
    }

    pub fn level(&self, modality: Modality) -> Option<PrivacyLevel> {
        match modality {
            Modality::Pose => self.pose,
            Modality::Audio => self.audio,
            Modality::Vision => self.vision,
        }
    }

    pub fn with(mut self, modality: Modality, level: PrivacyLevel) -> Self {
        match modality {
            Modality::Pose => self.pose = Some(level),
            Modality::Audio => self.audio = Some(level),
            Modality::Vision => self.vision = Some(level),
        }
        self
    }
}

/// Outcome of the gate for one sample
#[derive(Debug, Clone)]
pub enum Decision {
    Allow(ModalitySample),
    Redact(ModalitySample),
    Drop,
}

impl Decision {
    pub fn is_drop(&self) -> bool {
        matches!(self, Decision::Drop)
    }

    /// The sample that may continue into analysis, if any
    pub fn into_sample(self) -> Option<ModalitySample> {
        match self {
            Decision::Allow(sample) | Decision::Redact(sample) => Some(sample),
            Decision::Drop => None,
        }
    }
}

/// Apply `policy` to `sample`
pub fn admit(sample: ModalitySample, policy: &PrivacyPolicy) -> Decision {
    match policy.level(sample.modality) {
        None | Some(PrivacyLevel::Blocked) => Decision::Drop,
        Some(PrivacyLevel::LocalOnly) => {
            let mut sample = sample;
            sample.egress = Egress::LocalOnly;
            Decision::Allow(sample)
        }
        Some(PrivacyLevel::Anonymized) => {
            let payload = redact(&sample.payload);
            Decision::Redact(sample.with_payload(payload, Egress::Anonymized))
        }
        Some(PrivacyLevel::CloudAllowed) => {
            let mut sample = sample;
            sample.egress = Egress::Cloud;
            Decision::Allow(sample)
        }
    }
}

fn redact(payload: &SamplePayload) -> SamplePayload {
    match payload {
        SamplePayload::Pose(pose) => SamplePayload::Pose(redact_pose(pose)),
        SamplePayload::Audio(chunk) => SamplePayload::Audio(redact_audio(chunk)),
        SamplePayload::Vision(frame) => SamplePayload::Vision(redact_vision(frame)),
    }
}

/// Zero depth everywhere, cap body precision at 2 decimals and facial
/// landmarks at 1 decimal.
fn redact_pose(pose: &PoseLandmarks) -> PoseLandmarks {
    let landmarks = pose
        .landmarks
        .iter()
        .enumerate()
        .map(|(index, lm)| {
            let decimals = if PoseLandmarks::is_face(index) { 1 } else { 2 };
            let mut out = *lm;
            out.x = round_to(lm.x, decimals);
            out.y = round_to(lm.y, decimals);
            out.z = 0.0;
            out
        })
        .collect();

    PoseLandmarks::new(landmarks)
}

/// Replace the waveform with its per-window mean absolute amplitude
fn redact_audio(chunk: &AudioChunk) -> AudioChunk {
    let window = (chunk.sample_rate / AUDIO_ENVELOPE_WINDOWS_PER_SEC).max(1) as usize;

    let mut envelope = Vec::with_capacity(chunk.samples.len());
    for block in chunk.samples.chunks(window) {
        let sum: i64 = block.iter().map(|&s| (s as i64).abs()).sum();
        let mean = (sum / block.len() as i64).min(i16::MAX as i64) as i16;
        envelope.extend(std::iter::repeat(mean).take(block.len()));
    }

    AudioChunk {
        samples: envelope,
        sample_rate: chunk.sample_rate,
        redacted: true,
    }
}

/// Pixelate into `VISION_BLOCK` squares
fn redact_vision(frame: &VisionFrame) -> VisionFrame {
    let mut luma = frame.luma.clone();

    let mut by = 0;
    while by < frame.height {
        let mut bx = 0;
        while bx < frame.width {
            let x_end = (bx + VISION_BLOCK).min(frame.width);
            let y_end = (by + VISION_BLOCK).min(frame.height);

            let mut sum: u64 = 0;
            let mut count: u64 = 0;
            for y in by..y_end {
                for x in bx..x_end {
                    if let Some(p) = frame.pixel(x, y) {
                        sum += p as u64;
                        count += 1;
                    }
                }
            }

            if count > 0 {
                let mean = (sum / count) as u8;
                for y in by..y_end {
                    for x in bx..x_end {
                        if let Some(slot) = luma.get_mut((y * frame.width + x) as usize) {
                            *slot = mean;
                        }
                    }
                }
            }
            bx += VISION_BLOCK;
        }
        by += VISION_BLOCK;
    }

    VisionFrame::new(frame.width, frame.height, luma)
}

fn round_to(value: f32, decimals: i32) -> f32 {
    let factor = 10f32.powi(decimals);
    (value * factor).round() / factor
}
