use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::models::job::Job;

/// File name of the job table snapshot inside the data directory.
pub const METADATA_FILE: &str = "jobs_metadata.json";

/// Durable snapshot of the whole job table, stored as one JSON file.
///
/// Every save rewrites the full table to a temporary file and renames it over
/// the snapshot, so a failed write leaves the last good copy untouched.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<data_dir>/jobs_metadata.json`.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(METADATA_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(jobs)?;
        let tmp_path = self.tmp_path();

        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;

        tracing::debug!(
            jobs = jobs.len(),
            path = %self.path.display(),
            "Saved job metadata"
        );
        Ok(())
    }

    /// Read the snapshot. A missing or unreadable snapshot yields an empty
    /// table; stored metadata never prevents startup.
    pub async fn load(&self) -> Vec<Job> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No job metadata found, starting empty");
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to read job metadata, starting empty"
                );
                return Vec::new();
            }
        };

        match serde_json::from_slice::<Vec<Job>>(&contents) {
            Ok(jobs) => {
                tracing::info!(jobs = jobs.len(), path = %self.path.display(), "Loaded job metadata");
                jobs
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Job metadata is corrupt, starting empty"
                );
                Vec::new()
            }
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn job_in(dir: &Path) -> Job {
        let id = Uuid::new_v4();
        Job::new(
            id,
            dir.join(format!("{id}.ifc")),
            dir.join(format!("{id}_filtered.ifc")),
            Some("http://localhost:9000/hook".to_string()),
        )
    }

    #[tokio::test]
    async fn test_missing_snapshot_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::in_dir(dir.path());
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::in_dir(dir.path());
        std::fs::write(store.path(), b"{ not json").unwrap();
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_save_replaces_snapshot_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::in_dir(dir.path());

        let mut failed = job_in(dir.path());
        failed.start().unwrap();
        failed.fail("Input file not found").unwrap();
        let pending = job_in(dir.path());

        store.save(&[failed.clone()]).await.unwrap();
        store.save(&[failed.clone(), pending.clone()]).await.unwrap();

        let mut loaded = store.load().await;
        loaded.sort_by_key(|job| job.status.to_string());
        assert_eq!(loaded, vec![failed, pending]);
        assert!(!store.tmp_path().exists());
    }

    #[tokio::test]
    async fn test_failed_save_keeps_last_good_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::in_dir(dir.path());
        let job = job_in(dir.path());
        store.save(&[job.clone()]).await.unwrap();

        // A directory in the way of the temp file makes the write fail.
        std::fs::create_dir(store.tmp_path()).unwrap();
        assert!(store.save(&[]).await.is_err());

        assert_eq!(store.load().await, vec![job]);
    }
}
