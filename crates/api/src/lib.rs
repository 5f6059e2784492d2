//! Alert Engine API Server
//!
//! REST API and WebSocket server in front of the alert pipeline: report
//! ingestion, incident lifecycle actions, audit queries, and the live
//! event stream.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use pipeline::Engine;
use serde::Serialize;
use std::sync::Arc;
use tower_governor::GovernorLayer;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod rate_limit;
mod routes;

pub use rate_limit::RateLimitConfig;

/// Application state shared across handlers
pub struct AppState {
    /// The alert engine
    pub engine: Arc<Engine>,
    /// Version string
    pub version: String,
    /// Start time
    pub start_time: std::time::Instant,
    /// Prometheus render handle, when a recorder is installed
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl AppState {
    /// Create new application state around an engine
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: std::time::Instant::now(),
            metrics: None,
        }
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub metrics: EngineMetrics,
}

/// Engine counters surfaced on the health endpoint
#[derive(Debug, Serialize)]
pub struct EngineMetrics {
    pub open_incidents: usize,
    pub total_incidents: usize,
    pub alerts_seen: usize,
    pub delivery_attempts: usize,
    pub active_escalations: usize,
    pub stream_subscribers: usize,
}

/// Error body returned by every non-2xx response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Offending field for validation failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<&'static str>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            field: None,
        }
    }
}

/// Create the application router. Rate limiting applies to ingestion only
/// and requires serving with connect info for peer IP extraction.
pub fn create_router(state: Arc<AppState>, rate_limit: Option<&RateLimitConfig>) -> Router {
    let mut ingest = Router::new().route("/api/v1/alerts", post(routes::alerts::ingest));
    if let Some(config) = rate_limit {
        ingest = ingest.layer(GovernorLayer {
            config: rate_limit::create_governor_config(config),
        });
    }

    Router::new()
        .route("/api/v1/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/incidents", get(routes::incidents::list))
        .route(
            "/api/v1/incidents/:id/acknowledge",
            post(routes::incidents::acknowledge),
        )
        .route(
            "/api/v1/incidents/:id/resolve",
            post(routes::incidents::resolve),
        )
        .route(
            "/api/v1/incidents/:id/attempts",
            get(routes::incidents::attempts),
        )
        .route("/api/v1/policies", post(routes::incidents::reload_policies))
        .route("/api/v1/stream", get(routes::stream::stream))
        .merge(ingest)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let response = HealthResponse {
        status: "healthy".to_string(),
        timestamp,
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        metrics: EngineMetrics {
            open_incidents: state.engine.open_incident_count().await,
            total_incidents: state.engine.store().incident_count(),
            alerts_seen: state.engine.store().alert_count(),
            delivery_attempts: state.engine.store().attempt_count(),
            active_escalations: state.engine.scheduled_count(),
            stream_subscribers: state.engine.broadcaster().subscriber_count(),
        },
    };

    Json(response)
}

/// Prometheus exposition handler
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("metrics recorder not installed")),
        )
            .into_response(),
    }
}

/// Initialize logging
pub fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        warn!("Tracing subscriber already installed");
    }
}

/// Run the server: build the engine from config, wire the operator failure
/// queue, install the Prometheus recorder, and serve until shutdown.
pub async fn run_server(
    addr: &str,
    config: pipeline::EngineConfig,
    adapters: Vec<Arc<dyn delivery::ChannelAdapter>>,
) -> anyhow::Result<()> {
    let (engine, mut failure_rx) = Engine::new(config, adapters);

    // Operator failure queue: exhausted deliveries end up here after the
    // meta-alert has been raised
    tokio::spawn(async move {
        while let Some(attempt) = failure_rx.recv().await {
            warn!(
                "Delivery exhausted: incident {} step {} channel {} ({})",
                attempt.incident_id,
                attempt.step,
                attempt.channel,
                attempt.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    });

    let mut state = AppState::new(engine);
    match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        Ok(handle) => state.metrics = Some(handle),
        Err(e) => warn!("Prometheus recorder not installed: {}", e),
    }

    let app = create_router(Arc::new(state), Some(&RateLimitConfig::default()));

    info!("Starting API server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
