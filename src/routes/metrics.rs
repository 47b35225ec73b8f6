use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

/// Prometheus scrape endpoint, text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for the pipeline's metrics.
pub fn describe() {
    metrics::describe_counter!("face_jobs_submitted_total", "Jobs appended to the job stream");
    metrics::describe_counter!(
        "face_jobs_enqueue_failed_total",
        "Jobs persisted but not appended to the job stream"
    );
    metrics::describe_counter!(
        "face_jobs_processed_total",
        "Job entries acknowledged by workers, labelled by outcome"
    );
    metrics::describe_counter!(
        "face_jobs_retried_total",
        "Job entries left unacknowledged after a processing failure"
    );
    metrics::describe_counter!(
        "face_notifications_published_total",
        "Completion events appended to the notification stream"
    );
    metrics::describe_histogram!(
        "face_detection_seconds",
        metrics::Unit::Seconds,
        "Time spent in face detection per job"
    );
    metrics::describe_gauge!("face_ws_connections", "Open live notification connections");
}
