use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

use super::{payload_mismatch, ModalityAnalyzer};
use crate::error::AnalysisError;
use crate::modality::{
    AnalysisData, AnalysisResult, Modality, ModalitySample, ResultType, SamplePayload,
    SceneFeatures, VisionFrame,
};

/// Scene observation produced by a vision backend
#[derive(Debug, Clone, PartialEq)]
pub struct VisionObservation {
    pub brightness: f32,
    pub contrast: f32,
    pub person_visible: bool,
    pub label: Option<String>,
}

/// Frame-level scene understanding (on-device model, platform API, ...)
///
/// Called from a blocking worker thread; implementations may be CPU-heavy.
pub trait VisionBackend: Send + Sync + 'static {
    fn analyze(&self, frame: &VisionFrame) -> Result<VisionObservation>;
}

/// Luma statistics backend: exposure and contrast only
#[derive(Debug, Default)]
pub struct LumaStatistics;

impl LumaStatistics {
    const LOW_LIGHT: f32 = 0.15;
    /// Flat frames (empty wall, covered lens) have almost no contrast
    const MIN_SUBJECT_CONTRAST: f32 = 0.05;
}

impl VisionBackend for LumaStatistics {
    fn analyze(&self, frame: &VisionFrame) -> Result<VisionObservation> {
        if frame.luma.is_empty() {
            anyhow::bail!("empty frame");
        }

        let n = frame.luma.len() as f32;
        let mean = frame.luma.iter().map(|&p| p as f32).sum::<f32>() / n;
        let variance = frame
            .luma
            .iter()
            .map(|&p| {
                let d = p as f32 - mean;
                d * d
            })
            .sum::<f32>()
            / n;

        let brightness = mean / 255.0;
        let contrast = variance.sqrt() / 255.0;

        Ok(VisionObservation {
            brightness,
            contrast,
            person_visible: contrast >= Self::MIN_SUBJECT_CONTRAST,
            label: (brightness < Self::LOW_LIGHT).then(|| "low_light".to_string()),
        })
    }
}

/// Adapts a `VisionBackend` to the analyzer interface
pub struct VisionAnalyzer {
    backend: Arc<dyn VisionBackend>,
}

impl VisionAnalyzer {
    pub fn new(backend: Arc<dyn VisionBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait::async_trait]
impl ModalityAnalyzer for VisionAnalyzer {
    fn modality(&self) -> Modality {
        Modality::Vision
    }

    async fn analyze(&self, sample: &ModalitySample) -> Result<AnalysisResult, AnalysisError> {
        let SamplePayload::Vision(frame) = &sample.payload else {
            return Err(payload_mismatch(Modality::Vision, sample));
        };

        let backend = Arc::clone(&self.backend);
        let frame = frame.clone();
        let observation = tokio::task::spawn_blocking(move || backend.analyze(&frame))
            .await
            .map_err(|_| AnalysisError::Panicked {
                modality: Modality::Vision,
            })?
            .map_err(|e| AnalysisError::Failed {
                modality: Modality::Vision,
                reason: e.to_string(),
            })?;

        debug!(
            "Vision analyzed: brightness={:.2} contrast={:.2} person={}",
            observation.brightness, observation.contrast, observation.person_visible
        );

        let features = SceneFeatures {
            brightness: observation.brightness,
            contrast: observation.contrast,
            person_visible: observation.person_visible,
            label: observation.label,
        };

        Ok(AnalysisResult::for_sample(
            sample,
            ResultType::SceneContext,
            AnalysisData::Vision(features),
        ))
    }

    fn name(&self) -> &str {
        "vision"
    }
}
