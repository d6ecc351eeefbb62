//! Periodic retention cleanup.
//!
//! [`run`] is spawned once at startup and calls
//! [`JobOrchestrator::cleanup_expired`] on a fixed interval until its
//! [`CancellationToken`] fires. A sweep that has started always runs to the
//! end, so cancellation never interrupts a snapshot write.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::models::job::Job;
use crate::services::orchestrator::JobOrchestrator;

/// Run the retention loop: every `every`, drop jobs older than `retention`.
pub async fn run(
    orchestrator: Arc<JobOrchestrator>,
    retention: Duration,
    every: Duration,
    cancel: CancellationToken,
) {
    let every = if every.is_zero() {
        Duration::from_secs(1)
    } else {
        every
    };

    tracing::info!(
        retention_secs = retention.as_secs(),
        interval_secs = every.as_secs(),
        "Retention sweeper started"
    );

    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Retention sweeper stopping");
                break;
            }
            _ = ticker.tick() => {
                let removed = orchestrator.cleanup_expired(retention).await;
                if removed > 0 {
                    tracing::info!(removed, "Retention sweep removed expired jobs");
                } else {
                    tracing::debug!("Retention sweep: nothing expired");
                }
            }
        }
    }
}

/// Delete a job's input and output files. Missing files are fine; other
/// errors are logged and skipped.
pub async fn remove_job_files(job: &Job) {
    for path in [&job.input_path, &job.output_path] {
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::debug!(job_id = %job.id, path = %path.display(), "Removed job file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                job_id = %job.id,
                path = %path.display(),
                error = %e,
                "Failed to remove job file"
            ),
        }
    }
}
