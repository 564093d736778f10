//! Modality analyzers
//!
//! Each analyzer turns one admitted sample into a typed, confidence-scored
//! `AnalysisResult`. The pipeline and the fusion coordinator only see the
//! `ModalityAnalyzer` trait; concrete analyzers are selected by modality tag.

pub mod audio;
pub mod pose;
pub mod vision;

pub use audio::{AudioAnalyzer, AudioAnalyzerConfig};
pub use pose::PoseAnalyzer;
pub use vision::{LumaStatistics, VisionAnalyzer, VisionBackend, VisionObservation};

use std::sync::Arc;

use crate::error::AnalysisError;
use crate::modality::{AnalysisResult, Modality, ModalitySample};

/// Analyzer capability shared by the pose, audio and vision backends
#[async_trait::async_trait]
pub trait ModalityAnalyzer: Send + Sync {
    /// Modality this analyzer accepts
    fn modality(&self) -> Modality;

    /// Analyze one sample
    async fn analyze(&self, sample: &ModalitySample) -> Result<AnalysisResult, AnalysisError>;

    /// Analyzer name for logging
    fn name(&self) -> &str;
}

/// One analyzer per modality
#[derive(Clone)]
pub struct AnalyzerSet {
    pose: Arc<dyn ModalityAnalyzer>,
    audio: Arc<dyn ModalityAnalyzer>,
    vision: Arc<dyn ModalityAnalyzer>,
}

impl AnalyzerSet {
    /// Built-in analyzers
    pub fn standard(audio_config: AudioAnalyzerConfig) -> Self {
        Self {
            pose: Arc::new(PoseAnalyzer::new()),
            audio: Arc::new(AudioAnalyzer::new(audio_config)),
            vision: Arc::new(VisionAnalyzer::new(Arc::new(LumaStatistics))),
        }
    }

    /// Replace the analyzer for `analyzer.modality()`
    pub fn with(mut self, analyzer: Arc<dyn ModalityAnalyzer>) -> Self {
        match analyzer.modality() {
            Modality::Pose => self.pose = analyzer,
            Modality::Audio => self.audio = analyzer,
            Modality::Vision => self.vision = analyzer,
        }
        self
    }

    pub fn get(&self, modality: Modality) -> Arc<dyn ModalityAnalyzer> {
        match modality {
            Modality::Pose => Arc::clone(&self.pose),
            Modality::Audio => Arc::clone(&self.audio),
            Modality::Vision => Arc::clone(&self.vision),
        }
    }
}

impl Default for AnalyzerSet {
    fn default() -> Self {
        Self::standard(AudioAnalyzerConfig::default())
    }
}

pub(crate) fn payload_mismatch(expected: Modality, sample: &ModalitySample) -> AnalysisError {
    AnalysisError::PayloadMismatch {
        expected,
        actual: sample.payload.modality(),
    }
}
