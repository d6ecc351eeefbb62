//! Job lifecycle: creation, dispatch to the worker pool, completion,
//! persistence, callbacks and retention.
//!
//! The job table is guarded by one async mutex. Every state transition and the
//! snapshot write that follows it happen while that lock is held, so a poll
//! never sees a state that is not also the next thing persisted. Callbacks run
//! after the lock is released.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};
use crate::services::notifier::CallbackNotifier;
use crate::services::pool::{TaskHandle, WorkerPool};
use crate::services::store::MetadataStore;
use crate::services::sweeper;
use crate::services::transform::SelectionCriteria;

/// Error recorded on jobs failed by [`StaleJobPolicy::Fail`].
pub const RESTART_INTERRUPTED_MESSAGE: &str = "interrupted by service restart";

/// What to do with jobs found `processing` in the snapshot at startup. Their
/// transformation did not survive the restart, so they can never finish on
/// their own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaleJobPolicy {
    /// Reload as `processing` and leave them to the retention sweep.
    #[default]
    Keep,
    /// Mark them `failed`.
    Fail,
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub job_timeout: Duration,
    pub stale_job_policy: StaleJobPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {id} is {status}, only pending jobs can be submitted")]
    InvalidState { id: Uuid, status: JobStatus },
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

pub struct JobOrchestrator {
    jobs: Mutex<HashMap<Uuid, Job>>,
    settings: JobSettings,
    store: MetadataStore,
    pool: WorkerPool,
    notifier: CallbackNotifier,
}

impl JobOrchestrator {
    /// Build the orchestrator from the stored snapshot.
    pub async fn start(
        settings: JobSettings,
        store: MetadataStore,
        pool: WorkerPool,
        notifier: CallbackNotifier,
    ) -> Arc<Self> {
        let mut jobs: HashMap<Uuid, Job> = store
            .load()
            .await
            .into_iter()
            .map(|job| (job.id, job))
            .collect();
        let repaired = recover_stale_jobs(&mut jobs, settings.stale_job_policy);

        let orchestrator = Arc::new(Self {
            jobs: Mutex::new(jobs),
            settings,
            store,
            pool,
            notifier,
        });

        if repaired > 0 {
            let jobs = orchestrator.jobs.lock().await;
            orchestrator.persist(&jobs).await;
        }

        orchestrator
    }

    /// Register a new `pending` job. The caller writes the upload to
    /// `input_path` before submitting it.
    pub async fn create_job(&self, callback_url: Option<String>) -> Job {
        let id = Uuid::new_v4();
        let job = Job::new(
            id,
            self.settings.upload_dir.join(format!("{id}.ifc")),
            self.settings.output_dir.join(format!("{id}_filtered.ifc")),
            callback_url,
        );

        let mut jobs = self.jobs.lock().await;
        jobs.insert(id, job.clone());
        self.persist(&jobs).await;

        tracing::info!(job_id = %id, input_path = %job.input_path.display(), "Created job");
        job
    }

    pub async fn get_job(&self, id: Uuid) -> Option<Job> {
        self.jobs.lock().await.get(&id).cloned()
    }

    /// Move a pending job to `processing` and hand it to the worker pool.
    ///
    /// A job the pool refuses is failed on the spot and returned, so the
    /// caller still gets a job to poll.
    pub async fn submit_processing(
        self: &Arc<Self>,
        id: Uuid,
        criteria: SelectionCriteria,
    ) -> Result<Job, JobError> {
        let mut jobs = self.jobs.lock().await;

        let (input, output) = {
            let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
            job.start().map_err(|e| JobError::InvalidState {
                id,
                status: e.from,
            })?;
            (job.input_path.clone(), job.output_path.clone())
        };
        self.persist(&jobs).await;
        metrics::counter!("ifc_jobs_submitted_total").increment(1);

        let rejected = match self.pool.submit(input, output, criteria) {
            Ok(handle) => {
                let orchestrator = Arc::clone(self);
                tokio::spawn(async move { orchestrator.on_job_complete(id, handle).await });
                tracing::info!(job_id = %id, "Job dispatched to worker pool");
                false
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Failed to dispatch job");
                if let Some(job) = jobs.get_mut(&id) {
                    if let Err(t) = job.fail(format!("submission rejected: {e}")) {
                        tracing::warn!(job_id = %id, error = %t, "Could not fail rejected job");
                    }
                }
                metrics::counter!("ifc_jobs_failed_total").increment(1);
                self.persist(&jobs).await;
                true
            }
        };

        let job = jobs.get(&id).cloned().ok_or(JobError::NotFound(id))?;
        drop(jobs);

        if rejected {
            self.spawn_notify(&job);
        }
        Ok(job)
    }

    /// Fail a job that never reached the worker pool, for example because
    /// its upload could not be stored. Only `pending` jobs qualify.
    pub async fn fail_pending(
        self: &Arc<Self>,
        id: Uuid,
        error: impl Into<String>,
    ) -> Result<Job, JobError> {
        let mut jobs = self.jobs.lock().await;

        let job = {
            let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
            job.start().map_err(|e| JobError::InvalidState {
                id,
                status: e.from,
            })?;
            if let Err(e) = job.fail(error) {
                tracing::warn!(job_id = %id, error = %e, "Could not fail pending job");
            }
            job.clone()
        };
        self.persist(&jobs).await;
        drop(jobs);

        metrics::counter!("ifc_jobs_failed_total").increment(1);
        tracing::error!(
            job_id = %id,
            error = job.error.as_deref().unwrap_or_default(),
            "Job failed before dispatch"
        );

        self.spawn_notify(&job);
        Ok(job)
    }

    /// Remove every job created at least `max_age` ago together with its
    /// files. Returns how many jobs were removed.
    pub async fn cleanup_expired(&self, max_age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let mut jobs = self.jobs.lock().await;
        let expired: Vec<Uuid> = jobs
            .values()
            .filter(|job| job.created_at <= cutoff)
            .map(|job| job.id)
            .collect();

        if expired.is_empty() {
            tracing::debug!("No expired jobs to clean up");
            return 0;
        }

        for id in &expired {
            if let Some(job) = jobs.remove(id) {
                sweeper::remove_job_files(&job).await;
            }
        }
        self.persist(&jobs).await;

        metrics::counter!("ifc_jobs_swept_total").increment(expired.len() as u64);
        tracing::info!(removed = expired.len(), "Cleaned up expired jobs");
        expired.len()
    }

    pub async fn stats(&self) -> JobStats {
        let jobs = self.jobs.lock().await;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Refuse new work and flush the snapshot.
    pub async fn shutdown(&self) {
        self.pool.shutdown();
        let jobs = self.jobs.lock().await;
        self.persist(&jobs).await;
        tracing::info!(jobs = jobs.len(), "Job orchestrator shut down");
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn upload_dir(&self) -> &Path {
        &self.settings.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.settings.output_dir
    }

    pub fn metadata_path(&self) -> &Path {
        self.store.path()
    }

    async fn on_job_complete(self: Arc<Self>, id: Uuid, handle: TaskHandle) {
        let started = Instant::now();
        let outcome = handle.wait(self.settings.job_timeout).await;

        let finished = {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.get_mut(&id) else {
                tracing::warn!(job_id = %id, "Job removed before it finished, dropping result");
                return;
            };

            let applied = match outcome.error_message() {
                None => job.complete(),
                Some(message) => job.fail(message),
            };
            if let Err(e) = applied {
                tracing::warn!(job_id = %id, error = %e, "Ignoring completion for job");
                return;
            }

            let finished = job.clone();
            self.persist(&jobs).await;
            finished
        };

        metrics::histogram!("ifc_job_processing_seconds").record(started.elapsed().as_secs_f64());
        match finished.status {
            JobStatus::Completed => {
                metrics::counter!("ifc_jobs_completed_total").increment(1);
                tracing::info!(
                    job_id = %id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Job completed successfully"
                );
            }
            _ => {
                metrics::counter!("ifc_jobs_failed_total").increment(1);
                tracing::error!(
                    job_id = %id,
                    error = finished.error.as_deref().unwrap_or_default(),
                    "Job failed"
                );
            }
        }

        if finished.callback_url.is_some() {
            self.notifier.notify(&finished).await;
        }
    }

    /// Deliver the callback for a job failed outside the completion hook.
    fn spawn_notify(self: &Arc<Self>, job: &Job) {
        if job.callback_url.is_none() {
            return;
        }
        let orchestrator = Arc::clone(self);
        let job = job.clone();
        tokio::spawn(async move { orchestrator.notifier.notify(&job).await });
    }

    async fn persist(&self, jobs: &HashMap<Uuid, Job>) {
        let mut snapshot: Vec<Job> = jobs.values().cloned().collect();
        snapshot.sort_by_key(|job| job.created_at);
        if let Err(e) = self.store.save(&snapshot).await {
            tracing::error!(
                path = %self.store.path().display(),
                error = %e,
                "Failed to persist job metadata, continuing with in-memory state"
            );
        }
    }
}

/// Apply `policy` to jobs reloaded as `processing`. Returns how many changed.
fn recover_stale_jobs(jobs: &mut HashMap<Uuid, Job>, policy: StaleJobPolicy) -> usize {
    let mut changed = 0;
    for job in jobs.values_mut() {
        if job.status != JobStatus::Processing {
            continue;
        }
        match policy {
            StaleJobPolicy::Keep => {
                tracing::warn!(job_id = %job.id, "Reloaded job is stale: it was processing when the service stopped");
            }
            StaleJobPolicy::Fail => {
                if job.fail(RESTART_INTERRUPTED_MESSAGE).is_ok() {
                    tracing::warn!(job_id = %job.id, "Failed stale job interrupted by restart");
                    changed += 1;
                }
            }
        }
    }
    changed
}
