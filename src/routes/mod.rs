use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::services::jobs::JobService;

pub mod health;
pub mod jobs;
pub mod metrics;
pub mod ws;

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// State of the HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    pub app: AppState,
    pub jobs: Arc<JobService>,
    /// Cancelled on shutdown; live listeners close when it fires.
    pub shutdown: CancellationToken,
}

impl ApiState {
    pub fn new(app: AppState, jobs: JobService, shutdown: CancellationToken) -> Self {
        Self {
            app,
            jobs: Arc::new(jobs),
            shutdown,
        }
    }
}

/// The full API: job endpoints, live notifications, processed images under
/// the configured static root, health and metrics.
///
/// A static root that is not a path (e.g. an external URL) gets no route here;
/// processed images are then expected to be served elsewhere.
pub fn router(state: ApiState, prometheus: Arc<PrometheusHandle>) -> Router {
    let mut api = Router::new()
        .route("/health", get(health::health_check))
        .route("/image", post(jobs::create_job))
        .route("/jobs/{job_id}", get(jobs::get_job))
        .route("/jobs/{job_id}/processed-image", get(jobs::processed_image))
        .route("/ws", get(ws::notifications));

    let static_root = &state.app.settings.static_root;
    if static_root.starts_with('/') {
        let static_route = format!("{}/{{filename}}", static_root.trim_end_matches('/'));
        api = api.route(&static_route, get(jobs::static_image));
    } else {
        tracing::warn!(static_root = %static_root, "Static root is not a path, not serving processed images");
    }

    api.with_state(state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(prometheus),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_BYTES))
}
