//! REST API handlers for the coordinator status server

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Error;
use crate::metrics;

use super::election::Role;
use super::registry::{RegistryStats, Roster, WorkerRecord};
use super::server::AppState;
use super::NodeIdentity;

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Simple error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Role response
#[derive(Debug, Serialize)]
pub struct RoleResponse {
    #[serde(flatten)]
    pub identity: NodeIdentity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fencing_token: Option<u64>,
}

/// Roster response
#[derive(Debug, Serialize)]
pub struct RosterResponse {
    pub workers: Vec<WorkerRecord>,
    pub stats: RegistryStats,
}

impl RosterResponse {
    fn new(roster: &Roster, stats: RegistryStats) -> Self {
        Self {
            workers: roster.iter().cloned().collect(),
            stats,
        }
    }
}

/// Discovery request
#[derive(Debug, Default, Deserialize)]
pub struct DiscoverRequest {
    pub timeout_ms: Option<u64>,
}

/// Start-work request
#[derive(Debug, Deserialize)]
pub struct StartWorkRequest {
    #[serde(default)]
    pub payload: String,
    pub timeout_ms: Option<u64>,
}

/// Start-work response
#[derive(Debug, Serialize)]
pub struct StartWorkResponse {
    pub acknowledged: Vec<String>,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/api/health", get(health_check))
        // Leadership endpoints
        .route("/api/role", get(get_role))
        .route("/api/roster", get(get_roster))
        // Broadcast endpoints
        .route("/api/discover", post(discover))
        .route("/api/start-work", post(start_work))
        // Prometheus
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Map a coordinator error to an HTTP status
fn error_status(error: &Error) -> StatusCode {
    match error {
        Error::NotMaster => StatusCode::CONFLICT,
        Error::Publish(_) => StatusCode::BAD_GATEWAY,
        Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: Error) -> Response {
    (error_status(&error), Json(ErrorResponse::new(error.to_string()))).into_response()
}

// ============================================================================
// Health Handlers
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    }))
}

/// Prometheus text exposition
async fn prometheus_metrics() -> Response {
    match metrics::encode_metrics() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(format!("Failed to encode metrics: {e}"))),
        )
            .into_response(),
    }
}

// ============================================================================
// Leadership Handlers
// ============================================================================

/// Identity and current role
async fn get_role(State(state): State<AppState>) -> impl IntoResponse {
    let identity = state.coordinator.identity();
    let fencing_token = match identity.role {
        Role::Master => state.coordinator.fencing_token(),
        _ => None,
    };

    Json(ApiResponse::success(RoleResponse {
        identity,
        fencing_token,
    }))
}

/// Current roster snapshot
async fn get_roster(State(state): State<AppState>) -> impl IntoResponse {
    let roster = state.coordinator.current_roster().await;
    let stats = state.coordinator.registry_stats().await;

    Json(ApiResponse::success(RosterResponse::new(&roster, stats)))
}

// ============================================================================
// Broadcast Handlers
// ============================================================================

/// Broadcast a name report and return the roster
async fn discover(
    State(state): State<AppState>,
    request: Option<Json<DiscoverRequest>>,
) -> Response {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let timeout = request.timeout_ms.map(Duration::from_millis);

    match state.coordinator.discover_workers(timeout).await {
        Ok(roster) => {
            let stats = state.coordinator.registry_stats().await;
            (StatusCode::OK, Json(ApiResponse::success(RosterResponse::new(&roster, stats))))
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

/// Broadcast start-work and return the acknowledging workers
async fn start_work(
    State(state): State<AppState>,
    Json(request): Json<StartWorkRequest>,
) -> Response {
    let timeout = request.timeout_ms.map(Duration::from_millis);

    match state
        .coordinator
        .start_work(request.payload.into_bytes(), timeout)
        .await
    {
        Ok(acknowledged) => (
            StatusCode::OK,
            Json(ApiResponse::success(StartWorkResponse { acknowledged })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Tests
// ============================================================================
