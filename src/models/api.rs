use garde::Validate;
use serde::Serialize;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};
use crate::services::transform::SelectionCriteria;

/// Form fields accompanying an uploaded model (everything but the file).
#[derive(Debug, Default, Validate)]
pub struct ProcessRequest {
    #[garde(skip)]
    pub guids: Option<String>,

    #[garde(skip)]
    pub ifc_types: Option<String>,

    #[garde(skip)]
    pub storeys: Option<String>,

    #[garde(url)]
    pub callback_url: Option<String>,
}

impl ProcessRequest {
    pub fn criteria(&self) -> SelectionCriteria {
        SelectionCriteria {
            guids: split_list(self.guids.as_deref()),
            ifc_types: split_list(self.ifc_types.as_deref()),
            storeys: split_list(self.storeys.as_deref()),
        }
    }
}

/// Split a comma separated form value, dropping blank entries.
pub fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Response after submitting a model for filtering.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

impl From<&Job> for SubmitResponse {
    fn from(job: &Job) -> Self {
        let message = match job.status {
            JobStatus::Failed => "File uploaded but processing could not be started.",
            _ => "File uploaded and processing started.",
        };
        Self {
            job_id: job.id,
            status: job.status,
            message: message.to_string(),
        }
    }
}

/// Response for querying job status.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
    pub error: Option<String>,
    pub output_file: Option<String>,
}

impl From<&Job> for JobStatusResponse {
    fn from(job: &Job) -> Self {
        let message = match job.status {
            JobStatus::Pending => "Queued",
            JobStatus::Processing => "Processing...",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
        };
        Self {
            job_id: job.id,
            status: job.status,
            message: message.to_string(),
            error: job.error.clone(),
            output_file: job.output_reference(),
        }
    }
}
