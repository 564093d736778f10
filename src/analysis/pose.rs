use tracing::debug;

use super::{payload_mismatch, ModalityAnalyzer};
use crate::error::AnalysisError;
use crate::modality::{
    AnalysisData, AnalysisResult, Landmark, Modality, ModalitySample, PoseLandmarks, PoseMetrics,
    ResultType, SamplePayload,
};

/// Knee flexion below this is flagged as a safety concern
const SAFETY_KNEE_MIN_DEG: f32 = 40.0;
/// Shoulder height difference (normalized) flagged as a safety concern
const SAFETY_SHOULDER_TILT: f32 = 0.12;
/// Landmarks below this visibility are ignored for joint angles
const MIN_VISIBILITY: f32 = 0.5;

/// Derives joint angles and alignment from estimator landmarks
#[derive(Debug, Default)]
pub struct PoseAnalyzer;

impl PoseAnalyzer {
    pub fn new() -> Self {
        Self
    }

    fn metrics(pose: &PoseLandmarks) -> PoseMetrics {
        let knee = Self::best_side_angle(
            pose,
            (PoseLandmarks::LEFT_HIP, PoseLandmarks::LEFT_KNEE, PoseLandmarks::LEFT_ANKLE),
            (PoseLandmarks::RIGHT_HIP, PoseLandmarks::RIGHT_KNEE, PoseLandmarks::RIGHT_ANKLE),
        );
        let hip = Self::best_side_angle(
            pose,
            (PoseLandmarks::LEFT_SHOULDER, PoseLandmarks::LEFT_HIP, PoseLandmarks::LEFT_KNEE),
            (PoseLandmarks::RIGHT_SHOULDER, PoseLandmarks::RIGHT_HIP, PoseLandmarks::RIGHT_KNEE),
        );
        let elbow = Self::best_side_angle(
            pose,
            (PoseLandmarks::LEFT_SHOULDER, PoseLandmarks::LEFT_ELBOW, PoseLandmarks::LEFT_WRIST),
            (PoseLandmarks::RIGHT_SHOULDER, PoseLandmarks::RIGHT_ELBOW, PoseLandmarks::RIGHT_WRIST),
        );

        let shoulder_tilt = match (
            pose.get(PoseLandmarks::LEFT_SHOULDER),
            pose.get(PoseLandmarks::RIGHT_SHOULDER),
        ) {
            (Some(l), Some(r)) if l.visibility >= MIN_VISIBILITY && r.visibility >= MIN_VISIBILITY => {
                Some((l.y - r.y).abs())
            }
            _ => None,
        };

        let body: Vec<&Landmark> = pose
            .landmarks
            .iter()
            .enumerate()
            .filter(|(i, _)| !PoseLandmarks::is_face(*i))
            .map(|(_, lm)| lm)
            .collect();
        let mean_visibility = if body.is_empty() {
            0.0
        } else {
            body.iter().map(|lm| lm.visibility).sum::<f32>() / body.len() as f32
        };

        PoseMetrics {
            landmarks: pose.clone(),
            knee_angle_deg: knee,
            hip_angle_deg: hip,
            elbow_angle_deg: elbow,
            shoulder_tilt,
            mean_visibility,
        }
    }

    /// Joint angle from whichever side of the body is more visible
    fn best_side_angle(
        pose: &PoseLandmarks,
        left: (usize, usize, usize),
        right: (usize, usize, usize),
    ) -> Option<f32> {
        let side = |(a, b, c): (usize, usize, usize)| -> Option<(f32, f32)> {
            let (a, b, c) = (pose.get(a)?, pose.get(b)?, pose.get(c)?);
            let visibility = a.visibility.min(b.visibility).min(c.visibility);
            if visibility < MIN_VISIBILITY {
                return None;
            }
            Some((joint_angle(a, b, c), visibility))
        };

        match (side(left), side(right)) {
            (Some(l), Some(r)) => Some(if l.1 >= r.1 { l.0 } else { r.0 }),
            (Some(l), None) => Some(l.0),
            (None, Some(r)) => Some(r.0),
            (None, None) => None,
        }
    }

    fn classify(metrics: &PoseMetrics) -> ResultType {
        let knee_unsafe = metrics
            .knee_angle_deg
            .map(|angle| angle < SAFETY_KNEE_MIN_DEG)
            .unwrap_or(false);
        let tilt_unsafe = metrics
            .shoulder_tilt
            .map(|tilt| tilt > SAFETY_SHOULDER_TILT)
            .unwrap_or(false);

        if knee_unsafe || tilt_unsafe {
            ResultType::SafetyAlert
        } else {
            ResultType::FormAnalysis
        }
    }
}

#[async_trait::async_trait]
impl ModalityAnalyzer for PoseAnalyzer {
    fn modality(&self) -> Modality {
        Modality::Pose
    }

    async fn analyze(&self, sample: &ModalitySample) -> Result<AnalysisResult, AnalysisError> {
        let SamplePayload::Pose(pose) = &sample.payload else {
            return Err(payload_mismatch(Modality::Pose, sample));
        };

        if pose.landmarks.len() < PoseLandmarks::COUNT {
            return Err(AnalysisError::Failed {
                modality: Modality::Pose,
                reason: format!(
                    "incomplete landmark set: {} of {}",
                    pose.landmarks.len(),
                    PoseLandmarks::COUNT
                ),
            });
        }

        let metrics = Self::metrics(pose);
        let result_type = Self::classify(&metrics);

        debug!(
            "Pose analyzed: {:?} knee={:?} hip={:?} tilt={:?}",
            result_type, metrics.knee_angle_deg, metrics.hip_angle_deg, metrics.shoulder_tilt
        );

        Ok(AnalysisResult::for_sample(
            sample,
            result_type,
            AnalysisData::Pose(metrics),
        ))
    }

    fn name(&self) -> &str {
        "pose-geometry"
    }
}

/// Angle at `b` formed by `a-b-c`, in degrees
fn joint_angle(a: &Landmark, b: &Landmark, c: &Landmark) -> f32 {
    let ab = (a.x - b.x, a.y - b.y);
    let cb = (c.x - b.x, c.y - b.y);
    let dot = ab.0 * cb.0 + ab.1 * cb.1;
    let norm = (ab.0.hypot(ab.1)) * (cb.0.hypot(cb.1));
    if norm == 0.0 {
        return 0.0;
    }
    (dot / norm).clamp(-1.0, 1.0).acos().to_degrees()
}
