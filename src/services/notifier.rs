use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};

/// Body POSTed to a job's callback URL once it reaches a terminal state.
#[derive(Debug, Serialize)]
pub struct CallbackPayload<'a> {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub error: Option<&'a str>,
    pub output_reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl<'a> From<&'a Job> for CallbackPayload<'a> {
    fn from(job: &'a Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            error: job.error.as_deref(),
            output_reference: job.output_reference(),
            created_at: job.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The job has no callback URL.
    Skipped,
    Delivered(u16),
}

/// Best-effort, single-attempt delivery of job completion callbacks.
pub struct CallbackNotifier {
    http: Client,
}

impl CallbackNotifier {
    /// `timeout` bounds each delivery attempt end to end.
    pub fn new(timeout: Duration) -> Result<Self, NotifyError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    /// Deliver the callback for `job`, logging instead of failing.
    pub async fn notify(&self, job: &Job) {
        match self.deliver(job).await {
            Ok(Delivery::Skipped) => {}
            Ok(Delivery::Delivered(status)) => {
                tracing::info!(job_id = %job.id, status, "Callback delivered");
            }
            Err(e) => {
                metrics::counter!("ifc_callbacks_failed_total").increment(1);
                tracing::warn!(
                    job_id = %job.id,
                    callback_url = job.callback_url.as_deref().unwrap_or_default(),
                    error = %e,
                    "Callback delivery failed"
                );
            }
        }
    }

    /// One POST to the job's callback URL. No retry.
    pub async fn deliver(&self, job: &Job) -> Result<Delivery, NotifyError> {
        let Some(url) = job.callback_url.as_deref() else {
            return Ok(Delivery::Skipped);
        };

        let response = self
            .http
            .post(url)
            .json(&CallbackPayload::from(job))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::HttpStatus(status.as_u16()));
        }
        Ok(Delivery::Delivered(status.as_u16()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Callback returned HTTP {0}")]
    HttpStatus(u16),
}
