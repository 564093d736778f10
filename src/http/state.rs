use crate::config::Config;
use crate::engine::CoachingEngine;
use crate::privacy::SharedConsentStore;
use crate::transport::{CoachingTransport, NatsTransport};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Builds the transport for a new session, given its id
pub type TransportFactory = Arc<dyn Fn(&str) -> Box<dyn CoachingTransport> + Send + Sync>;

/// A running engine and the consent store feeding it
pub struct ActiveSession {
    pub engine: CoachingEngine,
    pub consent: SharedConsentStore,
}

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    /// Running coaching sessions (session_id → session)
    pub sessions: Arc<RwLock<HashMap<String, ActiveSession>>>,

    pub transport_factory: TransportFactory,
}

impl AppState {
    /// Sessions talk to the coaching service over NATS
    pub fn new(config: Config) -> Self {
        Self::with_transport_factory(
            config,
            Arc::new(|session_id: &str| {
                Box::new(NatsTransport::new(session_id)) as Box<dyn CoachingTransport>
            }),
        )
    }

    pub fn with_transport_factory(config: Config, transport_factory: TransportFactory) -> Self {
        Self {
            config: Arc::new(config),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            transport_factory,
        }
    }
}
