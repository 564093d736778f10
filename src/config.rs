use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

use crate::analysis::AudioAnalyzerConfig;
use crate::fusion::FusionConfig;
use crate::pipeline::PipelineConfig;
use crate::privacy::{PrivacyLevel, PrivacyPolicy};
use crate::session::SessionConfig;
use crate::transport::TransportConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub transport: TransportConfig,
    pub session: SessionConfig,
    pub fusion: FusionConfig,
    pub pipeline: PipelineConfig,
    pub audio: AudioAnalyzerConfig,
    pub privacy: PrivacyConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "pose-coach".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

/// Policy applied until the consent collaborator publishes one
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub default_policy: PrivacyPolicy,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        // Vision frames stay on the device unless the user opts in
        Self {
            default_policy: PrivacyPolicy::uniform(PrivacyLevel::CloudAllowed)
                .with(crate::modality::Modality::Vision, PrivacyLevel::LocalOnly),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the UI event stream
    pub event_capacity: usize,
    /// Capacity of the shared analysis result channel
    pub result_capacity: usize,
    pub metrics_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            result_capacity: 128,
            metrics_interval_ms: 1000,
        }
    }
}

impl EngineConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

impl Config {
    /// Load from a config file (extension optional), then apply
    /// `POSE_COACH__SECTION__KEY` environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("POSE_COACH").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
