use super::state::{ActiveSession, AppState};
use crate::analysis::AnalyzerSet;
use crate::engine::CoachingEngine;
use crate::metrics::MetricsSnapshot;
use crate::privacy::{PrivacyPolicy, SharedConsentStore};
use crate::session::SessionState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct StartSessionRequest {
    /// Optional session ID (if not provided, generate UUID)
    pub session_id: Option<String>,

    /// Initial privacy policy (defaults to the configured policy)
    pub privacy: Option<PrivacyPolicy>,
}

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub state: SessionState,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct StopSessionResponse {
    pub session_id: String,
    pub status: String,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub state: SessionState,
    pub fusion_suspended: bool,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct PrivacyResponse {
    pub session_id: String,
    pub policy: PrivacyPolicy,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

fn not_found(session_id: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        format!("Session {} not found", session_id),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /sessions/start
/// Start a coaching engine and connect it to the coaching service
pub async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartSessionRequest>,
) -> impl IntoResponse {
    // Generate or use provided session ID
    let session_id = req
        .session_id
        .unwrap_or_else(|| format!("coach-{}", uuid::Uuid::new_v4()));

    info!("Starting coaching session: {}", session_id);

    let mut sessions = state.sessions.write().await;
    if sessions.contains_key(&session_id) {
        return error_response(
            StatusCode::CONFLICT,
            format!("Session {} is already running", session_id),
        );
    }

    let mut config = (*state.config).clone();
    config.session.session_id = session_id.clone();

    let policy = req
        .privacy
        .unwrap_or_else(|| config.privacy.default_policy.clone());
    let consent = SharedConsentStore::new(policy);

    let engine = CoachingEngine::start(
        &config,
        (state.transport_factory)(&session_id),
        AnalyzerSet::standard(config.audio.clone()),
        Arc::new(consent.clone()),
    );

    if let Err(e) = engine.connect() {
        error!("Failed to connect session {}: {}", session_id, e);
        engine.shutdown().await;
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to connect session: {}", e),
        );
    }

    let current = engine.state();
    sessions.insert(session_id.clone(), ActiveSession { engine, consent });

    info!("Coaching session started: {}", session_id);

    (
        StatusCode::OK,
        Json(StartSessionResponse {
            session_id: session_id.clone(),
            state: current,
            message: format!("Coaching session {} started", session_id),
        }),
    )
        .into_response()
}

/// POST /sessions/:session_id/stop
/// Stop a session and return its final metrics
pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    info!("Stopping coaching session: {}", session_id);

    // Find and remove session
    let session = {
        let mut sessions = state.sessions.write().await;
        sessions.remove(&session_id)
    };

    match session {
        Some(session) => {
            let metrics = session.engine.shutdown().await;
            info!("Coaching session stopped: {}", session_id);
            (
                StatusCode::OK,
                Json(StopSessionResponse {
                    session_id,
                    status: "stopped".to_string(),
                    metrics,
                }),
            )
                .into_response()
        }
        None => {
            error!("Session {} not found", session_id);
            not_found(&session_id)
        }
    }
}

/// GET /sessions/:session_id/status
/// Get state and metrics of a coaching session
pub async fn get_session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let sessions = state.sessions.read().await;

    match sessions.get(&session_id) {
        Some(session) => (
            StatusCode::OK,
            Json(SessionStatusResponse {
                session_id: session_id.clone(),
                state: session.engine.state(),
                fusion_suspended: session.engine.is_fusion_suspended(),
                metrics: session.engine.metrics(),
            }),
        )
            .into_response(),
        None => not_found(&session_id),
    }
}

/// PUT /sessions/:session_id/privacy
/// Publish a new privacy policy; it applies from the next sample on
pub async fn update_privacy(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(policy): Json<PrivacyPolicy>,
) -> impl IntoResponse {
    let sessions = state.sessions.read().await;

    match sessions.get(&session_id) {
        Some(session) => {
            session.consent.update(policy.clone());
            (
                StatusCode::OK,
                Json(PrivacyResponse { session_id, policy }),
            )
                .into_response()
        }
        None => not_found(&session_id),
    }
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
