//! Health check endpoints

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub config_version: u64,
    pub providers_configured: usize,
    pub wallets_loaded: usize,
    pub open_reservations: usize,
    pub journal_entries: usize,
    pub breakers: Vec<BreakerState>,
}

#[derive(Serialize)]
pub struct BreakerState {
    pub key: String,
    pub state: &'static str,
    pub error_rate: f64,
}

/// Liveness probe - is the service running?
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "alfred",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe - is the service ready to handle requests?
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let snapshot = state.gateway.current();
    let providers_configured = snapshot.config.providers.len();

    let breakers = state
        .breaker
        .snapshot()
        .into_iter()
        .map(|b| BreakerState {
            key: b.key,
            state: b.state.as_str(),
            error_rate: b.error_rate,
        })
        .collect();

    let response = ReadinessResponse {
        status: if providers_configured > 0 {
            "ready"
        } else {
            "degraded"
        },
        config_version: snapshot.version,
        providers_configured,
        wallets_loaded: state.wallets.wallets_count(),
        open_reservations: state.wallets.open_reservations(),
        journal_entries: state.audit.len(),
        breakers,
    };

    let status = if providers_configured > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}
