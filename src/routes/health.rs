use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::path::Path;

use crate::app_state::AppState;
use crate::services::orchestrator::JobStats;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub workers: WorkerHealth,
    pub jobs: JobStats,
    pub storage: StorageHealth,
}

#[derive(Serialize)]
pub struct WorkerHealth {
    pub status: String,
    pub configured: usize,
    pub alive: usize,
}

#[derive(Serialize)]
pub struct StorageHealth {
    pub upload_dir_exists: bool,
    pub output_dir_exists: bool,
    pub metadata_file_exists: bool,
    pub metadata_file_size: u64,
}

/// GET /health — worker pool, job table and data directory status.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let pool = state.jobs.pool();
    let pool_healthy = pool.is_healthy();

    let metadata_file_size = tokio::fs::metadata(state.jobs.metadata_path())
        .await
        .map(|m| m.len())
        .ok();

    let storage = StorageHealth {
        upload_dir_exists: is_dir(state.jobs.upload_dir()).await,
        output_dir_exists: is_dir(state.jobs.output_dir()).await,
        metadata_file_exists: metadata_file_size.is_some(),
        metadata_file_size: metadata_file_size.unwrap_or(0),
    };

    let all_healthy = pool_healthy && storage.upload_dir_exists && storage.output_dir_exists;
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        workers: WorkerHealth {
            status: if pool_healthy { "ok" } else { "error" }.to_string(),
            configured: pool.worker_count(),
            alive: pool.alive_workers(),
        },
        jobs: state.jobs.stats().await,
        storage,
    };

    (status_code, Json(response))
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}
