//! Incident Lifecycle and Audit Routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use escalation::EscalationPolicy;
use incident_store::{DeliveryAttempt, Incident, IncidentStatus, StoreError};
use intake::Severity;
use pipeline::EngineError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use crate::{AppState, ErrorResponse};

/// Query parameters for the incident listing
#[derive(Debug, Deserialize)]
pub struct IncidentQuery {
    /// Filter by lifecycle status
    pub status: Option<IncidentStatus>,
    /// Filter by severity
    pub severity: Option<Severity>,
    /// Maximum number of records
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Response for the incident listing
#[derive(Debug, Serialize)]
pub struct IncidentListResponse {
    pub data: Vec<Incident>,
    pub count: usize,
}

/// Response for the per-incident delivery history
#[derive(Debug, Serialize)]
pub struct AttemptListResponse {
    pub incident_id: u64,
    pub data: Vec<DeliveryAttempt>,
    pub count: usize,
}

/// Policy reload request; replaces the whole snapshot
#[derive(Debug, Deserialize)]
pub struct PolicyReload {
    #[serde(default)]
    pub policies: Vec<EscalationPolicy>,
    #[serde(default)]
    pub default_policy: Option<EscalationPolicy>,
}

fn engine_error(e: EngineError) -> Response {
    match e {
        EngineError::Store(StoreError::NotFound(id)) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("incident {id} not found"))),
        )
            .into_response(),
        other => {
            error!("Incident operation failed: {}", other);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(other.to_string())),
            )
                .into_response()
        }
    }
}

/// List incidents, newest first
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<IncidentQuery>,
) -> Response {
    match state
        .engine
        .store()
        .snapshot(params.status, params.severity, params.limit)
        .await
    {
        Ok(data) => Json(IncidentListResponse {
            count: data.len(),
            data,
        })
        .into_response(),
        Err(e) => engine_error(EngineError::Store(e)),
    }
}

/// Acknowledge an incident; repeats are no-op successes
pub async fn acknowledge(State(state): State<Arc<AppState>>, Path(id): Path<u64>) -> Response {
    match state.engine.acknowledge(id).await {
        Ok(incident) => Json(incident).into_response(),
        Err(e) => engine_error(e),
    }
}

/// Resolve an incident; repeats are no-op successes
pub async fn resolve(State(state): State<Arc<AppState>>, Path(id): Path<u64>) -> Response {
    match state.engine.resolve(id).await {
        Ok(incident) => Json(incident).into_response(),
        Err(e) => engine_error(e),
    }
}

/// Delivery attempt history for one incident
pub async fn attempts(State(state): State<Arc<AppState>>, Path(id): Path<u64>) -> Response {
    if state.engine.store().get(id).is_none() {
        return engine_error(EngineError::Store(StoreError::NotFound(id)));
    }
    match state.engine.store().attempts_for(id) {
        Ok(data) => Json(AttemptListResponse {
            incident_id: id,
            count: data.len(),
            data,
        })
        .into_response(),
        Err(e) => engine_error(EngineError::Store(e)),
    }
}

/// Swap in a new policy snapshot; open incidents keep their bound policy
pub async fn reload_policies(
    State(state): State<Arc<AppState>>,
    Json(reload): Json<PolicyReload>,
) -> StatusCode {
    state
        .engine
        .reload_policies(reload.policies, reload.default_policy);
    StatusCode::NO_CONTENT
}
