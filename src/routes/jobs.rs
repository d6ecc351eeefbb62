use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::multipart::Field;
use axum::extract::{Multipart, Path as UrlPath, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{JobStatusResponse, ProcessRequest, SubmitResponse};
use crate::models::job::{Job, JobStatus};
use crate::routes::ApiError;
use crate::services::orchestrator::{JobError, JobOrchestrator};
use crate::services::transform::SelectionCriteria;

/// MIME type for IFC (STEP physical file) models.
const IFC_MEDIA_TYPE: &str = "application/x-step";

/// POST /api/v1/process — Upload an IFC model and start a filtering job.
pub async fn submit_processing_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<SubmitResponse>, ApiError> {
    let staging = state
        .jobs
        .upload_dir()
        .join(format!("{}.part", Uuid::new_v4()));

    let form = match read_form(&mut multipart, &staging).await {
        Ok(form) => form,
        Err(e) => {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e);
        }
    };

    let job = state.jobs.create_job(form.callback_url.clone()).await;
    let job = start_job(&state.jobs, &staging, job, form.criteria()).await?;
    Ok(Json(SubmitResponse::from(&job)))
}

/// Move the staged upload to the job's input path and submit the job. A job
/// whose upload cannot be moved is failed, so the caller still gets an id.
async fn start_job(
    jobs: &Arc<JobOrchestrator>,
    staging: &Path,
    job: Job,
    criteria: SelectionCriteria,
) -> Result<Job, ApiError> {
    if let Err(e) = tokio::fs::rename(staging, &job.input_path).await {
        tracing::error!(job_id = %job.id, error = %e, "Failed to store uploaded file");
        let _ = tokio::fs::remove_file(staging).await;
        let failed = jobs
            .fail_pending(job.id, format!("failed to store upload: {e}"))
            .await?;
        return Ok(failed);
    }

    Ok(jobs.submit_processing(job.id, criteria).await?)
}

/// GET /api/v1/jobs/{job_id} — Check the status of a job.
pub async fn get_job_status(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state
        .jobs
        .get_job(job_id)
        .await
        .ok_or(JobError::NotFound(job_id))?;
    Ok(Json(JobStatusResponse::from(&job)))
}

/// GET /api/v1/jobs/{job_id}/download — Download the filtered model.
///
/// Only completed jobs are served; a timed-out job's output may still be
/// being written and is never exposed.
pub async fn download_job_result(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<Uuid>,
) -> Result<Response, ApiError> {
    let job = state
        .jobs
        .get_job(job_id)
        .await
        .ok_or(JobError::NotFound(job_id))?;

    if job.status != JobStatus::Completed {
        return Err(ApiError::NotReady(job.status));
    }

    let file = match tokio::fs::File::open(&job.output_path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::warn!(job_id = %job_id, "Output of completed job is missing");
            return Err(JobError::NotFound(job_id).into());
        }
        Err(e) => return Err(e.into()),
    };

    let headers = [
        (header::CONTENT_TYPE, IFC_MEDIA_TYPE.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"filtered_{job_id}.ifc\""),
        ),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

/// Collect the text fields and stream the `file` field to `staging`.
async fn read_form(multipart: &mut Multipart, staging: &Path) -> Result<ProcessRequest, ApiError> {
    let mut form = ProcessRequest::default();
    let mut uploaded: Option<u64> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => uploaded = Some(save_field(field, staging).await?),
            "guids" => form.guids = non_empty(field.text().await?),
            "ifc_types" => form.ifc_types = non_empty(field.text().await?),
            "storeys" => form.storeys = non_empty(field.text().await?),
            "callback_url" => form.callback_url = non_empty(field.text().await?),
            other => tracing::debug!(field = other, "Ignoring unknown form field"),
        }
    }

    form.validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    match uploaded {
        None => Err(ApiError::BadRequest("missing `file` field".to_string())),
        Some(0) => Err(ApiError::BadRequest("uploaded file is empty".to_string())),
        Some(bytes) => {
            tracing::debug!(bytes, staging = %staging.display(), "Received upload");
            Ok(form)
        }
    }
}

async fn save_field(mut field: Field<'_>, path: &Path) -> Result<u64, ApiError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
