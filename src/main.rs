use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ifc_splitter::app_state::AppState;
use ifc_splitter::config::AppConfig;
use ifc_splitter::routes;
use ifc_splitter::services::{
    notifier::CallbackNotifier,
    orchestrator::JobOrchestrator,
    pool::WorkerPool,
    store::MetadataStore,
    sweeper,
    transform::CommandTransformer,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing ifc-splitter server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_histogram!(
        "ifc_job_processing_seconds",
        "Time from dispatch to a terminal state"
    );
    metrics::describe_counter!("ifc_jobs_submitted_total", "Jobs handed to the worker pool");
    metrics::describe_counter!("ifc_jobs_completed_total", "Jobs that completed");
    metrics::describe_counter!("ifc_jobs_failed_total", "Jobs that failed");
    metrics::describe_counter!("ifc_jobs_swept_total", "Jobs removed by retention");
    metrics::describe_counter!("ifc_callbacks_failed_total", "Callback deliveries that failed");

    // Data directories
    for dir in [config.upload_dir(), config.output_dir()] {
        tokio::fs::create_dir_all(&dir)
            .await
            .expect("Failed to create data directory");
    }

    // Worker pool running the external filter program
    let transformer = CommandTransformer::from_command_line(&config.transform_command)
        .expect("Invalid TRANSFORM_COMMAND");
    let pool = WorkerPool::new(transformer, config.worker_count, config.queue_capacity);

    let notifier =
        CallbackNotifier::new(config.callback_timeout()).expect("Failed to build HTTP client");
    let store = MetadataStore::in_dir(&config.data_dir);

    tracing::info!(path = %store.path().display(), "Loading job metadata");
    let orchestrator = JobOrchestrator::start(config.job_settings(), store, pool, notifier).await;

    // Retention sweeper
    let cancel = CancellationToken::new();
    let sweeper_task = tokio::spawn(sweeper::run(
        Arc::clone(&orchestrator),
        config.retention(),
        config.sweep_interval(),
        cancel.clone(),
    ));

    let app = routes::router(
        AppState::new(Arc::clone(&orchestrator)),
        Some(prometheus_handle),
        config.max_upload_bytes,
    );

    tracing::info!("Starting ifc-splitter on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Shutting down");
    cancel.cancel();
    if let Err(e) = sweeper_task.await {
        tracing::error!(error = %e, "Retention sweeper did not stop cleanly");
    }
    orchestrator.shutdown().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
