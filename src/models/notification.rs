use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Completion event published by a worker onto the notification stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEvent {
    pub job_id: Uuid,
    pub processed_url: String,
}

impl NotificationEvent {
    /// Builds the event for a processed file served under `static_root`.
    pub fn new(job_id: Uuid, static_root: &str, processed_filename: &str) -> Self {
        Self {
            job_id,
            processed_url: format!("{}/{}", static_root.trim_end_matches('/'), processed_filename),
        }
    }
}

/// Message pushed to a live listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub connection_id: String,
    pub job_id: Uuid,
    pub processed_url: String,
}

impl Notification {
    pub fn for_connection(connection_id: &str, event: NotificationEvent) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            job_id: event.job_id,
            processed_url: event.processed_url,
        }
    }
}
