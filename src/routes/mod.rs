use std::sync::Arc;

use axum::extract::multipart::MultipartError;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::models::job::JobStatus;
use crate::services::orchestrator::JobError;

pub mod health;
pub mod jobs;
pub mod metrics;

/// Build the HTTP router. `/metrics` is only mounted when a Prometheus
/// recorder was installed.
pub fn router(
    state: AppState,
    prometheus: Option<Arc<PrometheusHandle>>,
    max_upload_bytes: usize,
) -> Router {
    let mut app = Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/process", post(jobs::submit_processing_job))
        .route("/api/v1/jobs/{job_id}", get(jobs::get_job_status))
        .route("/api/v1/jobs/{job_id}/download", get(jobs::download_job_result))
        .with_state(state);

    if let Some(handle) = prometheus {
        app = app.route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(handle),
        );
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
}

/// Error type for HTTP handlers, rendered as `{"error": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error("Job is not complete. Current status: {0}")]
    NotReady(JobStatus),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Job(JobError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "Job not found".to_string())
            }
            ApiError::Job(e @ JobError::InvalidState { .. }) => (StatusCode::CONFLICT, e.to_string()),
            ApiError::NotReady(_) | ApiError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
