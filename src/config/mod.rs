use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::orchestrator::{JobSettings, StaleJobPolicy};

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Root for uploads, filtered outputs and the job metadata snapshot.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Number of transformation worker threads.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Jobs that may wait for a worker before submissions are rejected.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long a job's completion is awaited before it is failed.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Age after which jobs and their files are removed.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Per-request timeout for completion callbacks.
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// External filter program, split on whitespace.
    #[serde(default = "default_transform_command")]
    pub transform_command: String,

    /// `keep` or `fail` for jobs found processing at startup.
    #[serde(default)]
    pub stale_job_policy: StaleJobPolicy,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_worker_count() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    64
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    600
}

fn default_callback_timeout_secs() -> u64 {
    10
}

fn default_max_upload_bytes() -> usize {
    500 * 1024 * 1024
}

fn default_transform_command() -> String {
    "ifc-splitter split".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("processed")
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }

    pub fn job_settings(&self) -> JobSettings {
        JobSettings {
            upload_dir: self.upload_dir(),
            output_dir: self.output_dir(),
            job_timeout: self.job_timeout(),
            stale_job_policy: self.stale_job_policy,
        }
    }
}
