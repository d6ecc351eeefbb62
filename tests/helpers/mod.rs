//! Test helper utilities shared by the orchestrator and API tests
#![allow(dead_code)]

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

use ifc_splitter::models::job::Job;
use ifc_splitter::services::{
    notifier::CallbackNotifier,
    orchestrator::{JobOrchestrator, JobSettings, StaleJobPolicy},
    pool::WorkerPool,
    store::MetadataStore,
    transform::{SelectionCriteria, TransformError, Transformer},
};

pub const SAMPLE_IFC: &[u8] = b"ISO-10303-21;\nHEADER;\nENDSEC;\nDATA;\nENDSEC;\nEND-ISO-10303-21;\n";

/// Knobs for [`start_orchestrator`].
pub struct Options {
    pub workers: usize,
    pub queue_capacity: usize,
    pub job_timeout: Duration,
    pub stale_job_policy: StaleJobPolicy,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: 16,
            job_timeout: Duration::from_secs(10),
            stale_job_policy: StaleJobPolicy::Keep,
        }
    }
}

/// Start an orchestrator rooted at `data_dir`, creating its directories.
pub async fn start_orchestrator(
    data_dir: &Path,
    transformer: impl Transformer,
    options: Options,
) -> Arc<JobOrchestrator> {
    let settings = JobSettings {
        upload_dir: data_dir.join("uploads"),
        output_dir: data_dir.join("processed"),
        job_timeout: options.job_timeout,
        stale_job_policy: options.stale_job_policy,
    };
    std::fs::create_dir_all(&settings.upload_dir).unwrap();
    std::fs::create_dir_all(&settings.output_dir).unwrap();

    JobOrchestrator::start(
        settings,
        MetadataStore::in_dir(data_dir),
        WorkerPool::new(transformer, options.workers, options.queue_capacity),
        CallbackNotifier::new(Duration::from_secs(2)).unwrap(),
    )
    .await
}

/// Writes `FILTERED guids=<..>` followed by the input bytes to the output.
pub fn copy_transformer() -> impl Transformer {
    |input: &Path, output: &Path, criteria: &SelectionCriteria| -> Result<(), TransformError> {
        let contents = std::fs::read(input).map_err(|_| {
            TransformError::Failed(format!("Input file not found: {}", input.display()))
        })?;
        let mut filtered = format!("FILTERED guids={}\n", criteria.guids.join(",")).into_bytes();
        filtered.extend(contents);
        std::fs::write(output, filtered).map_err(|e| TransformError::Failed(e.to_string()))
    }
}

/// Controls a transformer that blocks until released.
pub struct Gate {
    started: Mutex<Receiver<()>>,
    release: Sender<()>,
}

impl Gate {
    /// Block until a transformation has entered the gate.
    pub fn wait_started(&self) {
        self.started
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(5))
            .expect("transformation never started");
    }

    pub fn release(&self) {
        self.release.send(()).unwrap();
    }
}

/// A transformer that signals when it starts and writes its output only once
/// released. Dropping the [`Gate`] fails anything still waiting.
pub fn gated_transformer() -> (impl Transformer, Gate) {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);
    let release_rx = Mutex::new(release_rx);

    let transformer =
        move |_: &Path, output: &Path, _: &SelectionCriteria| -> Result<(), TransformError> {
            let _ = started_tx.lock().unwrap().send(());
            release_rx
                .lock()
                .unwrap()
                .recv()
                .map_err(|_| TransformError::Failed("gate dropped".to_string()))?;
            std::fs::write(output, b"FILTERED\n").map_err(|e| TransformError::Failed(e.to_string()))
        };

    let gate = Gate {
        started: Mutex::new(started_rx),
        release: release_tx,
    };
    (transformer, gate)
}

/// Create a job and write an upload for it, as the HTTP surface does.
pub async fn create_with_upload(
    orchestrator: &JobOrchestrator,
    callback_url: Option<&str>,
    contents: &[u8],
) -> Job {
    let job = orchestrator
        .create_job(callback_url.map(str::to_string))
        .await;
    tokio::fs::write(&job.input_path, contents).await.unwrap();
    job
}

/// Poll a job until it reaches a terminal state (with timeout).
pub async fn wait_for_terminal(orchestrator: &JobOrchestrator, id: Uuid, timeout_secs: u64) -> Job {
    let max_attempts = timeout_secs * 50; // Poll every 20ms

    for _ in 0..max_attempts {
        let job = orchestrator.get_job(id).await.expect("job disappeared");
        if job.status.is_terminal() {
            return job;
        }
        sleep(Duration::from_millis(20)).await;
    }

    panic!("Job {id} did not finish within {timeout_secs} seconds");
}

pub type Received = Arc<tokio::sync::Mutex<Vec<serde_json::Value>>>;

/// Start a local HTTP endpoint recording every callback body it receives.
pub async fn spawn_callback_receiver() -> (String, Received) {
    let received: Received = Arc::default();

    let app = Router::new()
        .route(
            "/hook",
            post(
                |State(received): State<Received>, Json(body): Json<serde_json::Value>| async move {
                    received.lock().await.push(body);
                    StatusCode::NO_CONTENT
                },
            ),
        )
        .with_state(Arc::clone(&received));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/hook"), received)
}

/// Wait until at least `count` callbacks were received.
pub async fn wait_for_callbacks(received: &Received, count: usize) -> Vec<serde_json::Value> {
    for _ in 0..250 {
        {
            let bodies = received.lock().await;
            if bodies.len() >= count {
                return bodies.clone();
            }
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {count} callbacks");
}
