use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Error recorded when a job fails without a usable message.
const FALLBACK_ERROR: &str = "transformation failed";

/// Status of a filtering job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// `Completed` and `Failed` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// A model filtering job.
///
/// Status only moves forward along `pending -> processing -> completed|failed`,
/// and `error` is present exactly when the status is `failed`. The mutators
/// below are the only way to change either field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: Uuid,
        input_path: PathBuf,
        output_path: PathBuf,
        callback_url: Option<String>,
    ) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            input_path,
            output_path,
            error: None,
            callback_url,
            created_at: Utc::now(),
        }
    }

    /// `pending -> processing`
    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.advance(JobStatus::Pending, JobStatus::Processing)
    }

    /// `processing -> completed`
    pub fn complete(&mut self) -> Result<(), InvalidTransition> {
        self.advance(JobStatus::Processing, JobStatus::Completed)
    }

    /// `processing -> failed`, recording `error`. An empty message is replaced
    /// so a failed job always explains itself.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), InvalidTransition> {
        self.advance(JobStatus::Processing, JobStatus::Failed)?;
        let error = error.into();
        self.error = Some(if error.trim().is_empty() {
            FALLBACK_ERROR.to_string()
        } else {
            error
        });
        Ok(())
    }

    /// Public location of the filtered file, only once it is safe to serve.
    pub fn output_reference(&self) -> Option<String> {
        (self.status == JobStatus::Completed).then(|| format!("/api/v1/jobs/{}/download", self.id))
    }

    fn advance(&mut self, from: JobStatus, to: JobStatus) -> Result<(), InvalidTransition> {
        if self.status != from {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}
