use std::sync::Arc;

use crate::services::orchestrator::JobOrchestrator;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobOrchestrator>,
}

impl AppState {
    pub fn new(jobs: Arc<JobOrchestrator>) -> Self {
        Self { jobs }
    }
}
