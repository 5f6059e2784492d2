//! Alert Ingestion Route

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use intake::RawReport;
use pipeline::EngineError;
use std::sync::Arc;
use tracing::error;

use crate::{AppState, ErrorResponse};

/// Ingest one raw error report.
///
/// Classification, correlation, and suppression have completed by the time
/// the 202 is returned; escalation timers run in the background.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(raw): Json<RawReport>,
) -> impl IntoResponse {
    match state.engine.ingest(raw).await {
        Ok(outcome) => (StatusCode::ACCEPTED, Json(outcome)).into_response(),
        Err(EngineError::Validation(e)) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
                field: Some(e.field()),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Ingestion failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(e.to_string())),
            )
                .into_response()
        }
    }
}
