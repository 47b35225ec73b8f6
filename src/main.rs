use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use face_jobs::{
    app_state::AppState,
    config::AppConfig,
    routes::{self, ApiState},
    services::jobs::JobService,
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

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing face-jobs server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    routes::metrics::describe();

    // Connect the job store, blob store and streams
    let state = AppState::from_config(&config)
        .await
        .expect("Failed to initialize application state");

    // Initialize the job producer
    let jobs = JobService::connect(&state)
        .await
        .expect("Failed to connect to the job stream");

    // Build API routes
    let shutdown_token = CancellationToken::new();
    let app = routes::router(
        ApiState::new(state, jobs, shutdown_token.clone()),
        Arc::new(prometheus_handle),
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    // Stop accepting connections and close live listeners on CTRL+C/SIGTERM
    shutdown::cancel_on_signal(shutdown_token.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await
        .expect("Server error");

    tracing::info!("Server stopped");
}
