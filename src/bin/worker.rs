use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use face_jobs::{
    app_state::AppState,
    config::AppConfig,
    routes,
    services::{detector::SkinToneDetector, worker::WorkerPool},
    shutdown,
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

    tracing::info!("Starting face detection workers");

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize Prometheus exporter
    PrometheusBuilder::new()
        .install()
        .expect("Failed to install Prometheus exporter");
    routes::metrics::describe();

    // Connect the job store, blob store and streams
    let state = AppState::from_config(&config)
        .await
        .expect("Failed to initialize application state");

    // Workers finish their current job, then stop on CTRL+C/SIGTERM
    let cancel = CancellationToken::new();
    shutdown::cancel_on_signal(cancel.clone());

    // Create the consumer group and spawn the workers
    let pool = WorkerPool::start(&state, Arc::new(SkinToneDetector::default()), cancel.clone())
        .await
        .expect("Failed to start worker pool");

    tracing::info!(
        workers = pool.len(),
        group = %state.settings.consumer_group,
        stream = %state.settings.job_stream,
        "Workers ready, processing jobs"
    );

    pool.wait().await;
}
