//! HTTP API server for external control
//!
//! This module provides a REST API for controlling coaching sessions:
//! - POST /sessions/start - Start a new coaching session
//! - POST /sessions/:id/stop - Stop a session and return its final metrics
//! - GET /sessions/:id/status - Query session state and metrics
//! - PUT /sessions/:id/privacy - Publish a new privacy policy
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::{ActiveSession, AppState, TransportFactory};
