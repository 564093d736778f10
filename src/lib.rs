pub mod analysis;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod http;
pub mod metrics;
pub mod modality;
pub mod pipeline;
pub mod privacy;
pub mod session;
pub mod transport;

pub use analysis::{AnalyzerSet, ModalityAnalyzer};
pub use config::Config;
pub use engine::{CoachingEngine, EngineEvent};
pub use error::{AnalysisError, ErrorSeverity, SessionError, SessionErrorEvent};
pub use fusion::{FusedInsight, FusionConfig};
pub use http::{create_router, AppState};
pub use metrics::{MetricsAggregator, MetricsSnapshot};
pub use modality::{AnalysisResult, Modality, ModalitySample, SamplePayload};
pub use pipeline::{IngestionPipeline, PipelineConfig};
pub use privacy::{ConsentStore, PrivacyLevel, PrivacyPolicy, SharedConsentStore};
pub use session::{SessionConfig, SessionHandle, SessionState};
pub use transport::{CoachingTransport, NatsTransport, TransportConfig};
