#![allow(dead_code)]
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::api::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    registry: ComponentHealth,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl ComponentHealth {
    fn healthy() -> Self {
        Self { status: "healthy".to_string(), detail: None }
    }
}

/// GET /health — reports registry reachability; the registry's single
/// writer lock never blocks for long, so a successful snapshot is enough.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let _ = state.registry.snapshot().await;
    let response = HealthResponse { status: "healthy".to_string(), timestamp: chrono::Utc::now(), checks: HealthChecks { registry: ComponentHealth::healthy() } };
    (StatusCode::OK, Json(response))
}

/// GET /health/ready — readiness probe.
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let _ = state.registry.snapshot().await;
    StatusCode::OK
}

/// GET /health/live — liveness probe.
pub async fn liveness_check() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_health_healthy() {
        let health = ComponentHealth::healthy();
        assert_eq!(health.status, "healthy");
        assert!(health.detail.is_none());
    }
}
