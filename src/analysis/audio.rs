use serde::Deserialize;
use tracing::debug;

use super::{payload_mismatch, ModalityAnalyzer};
use crate::error::AnalysisError;
use crate::modality::{
    AnalysisData, AnalysisResult, AudioFeatures, Modality, ModalitySample, ResultType,
    SamplePayload,
};

/// Configuration for speech activity detection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioAnalyzerConfig {
    /// Normalized RMS level at or above which a chunk counts as speech
    pub speech_threshold: f32,
    /// Zero-crossing rate above which a loud chunk is treated as noise
    pub max_speech_zcr: f32,
}

impl Default for AudioAnalyzerConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 0.02,
            max_speech_zcr: 0.5,
        }
    }
}

/// Energy-based speech activity detector
pub struct AudioAnalyzer {
    config: AudioAnalyzerConfig,
}

impl AudioAnalyzer {
    pub fn new(config: AudioAnalyzerConfig) -> Self {
        Self { config }
    }

    /// RMS level normalized to [0, 1]
    fn rms_level(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = samples
            .iter()
            .map(|&s| {
                let v = s as f64 / i16::MAX as f64;
                v * v
            })
            .sum();
        ((sum_sq / samples.len() as f64).sqrt() as f32).min(1.0)
    }

    fn zero_crossing_rate(samples: &[i16]) -> f32 {
        if samples.len() < 2 {
            return 0.0;
        }
        let crossings = samples
            .windows(2)
            .filter(|w| (w[0] >= 0) != (w[1] >= 0))
            .count();
        crossings as f32 / (samples.len() - 1) as f32
    }
}

#[async_trait::async_trait]
impl ModalityAnalyzer for AudioAnalyzer {
    fn modality(&self) -> Modality {
        Modality::Audio
    }

    async fn analyze(&self, sample: &ModalitySample) -> Result<AnalysisResult, AnalysisError> {
        let SamplePayload::Audio(chunk) = &sample.payload else {
            return Err(payload_mismatch(Modality::Audio, sample));
        };

        if chunk.samples.is_empty() {
            return Err(AnalysisError::Failed {
                modality: Modality::Audio,
                reason: "empty audio chunk".to_string(),
            });
        }

        let level = Self::rms_level(&chunk.samples);
        // A redacted envelope has no sign changes; its ZCR carries no information
        let zero_crossing_rate = if chunk.redacted {
            0.0
        } else {
            Self::zero_crossing_rate(&chunk.samples)
        };
        let speech_active =
            level >= self.config.speech_threshold && zero_crossing_rate <= self.config.max_speech_zcr;

        let result_type = if speech_active {
            ResultType::SpeechActivity
        } else {
            ResultType::Silence
        };

        debug!(
            "Audio analyzed: level={:.3} zcr={:.3} speech={}",
            level, zero_crossing_rate, speech_active
        );

        let features = AudioFeatures {
            level,
            zero_crossing_rate,
            speech_active,
            duration_ms: chunk.duration().as_millis() as u64,
            sample_rate: chunk.sample_rate,
            pcm: (!chunk.redacted).then(|| chunk.samples.clone()),
        };

        Ok(AnalysisResult::for_sample(
            sample,
            result_type,
            AnalysisData::Audio(features),
        ))
    }

    fn name(&self) -> &str {
        "audio-energy"
    }
}
