use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::job::{BoundingBox, Job, JobState};

/// Response after submitting an image.
#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl From<&Job> for CreateJobResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            created_at: job.created_at,
        }
    }
}

/// Response for querying a job.
#[derive(Debug, Serialize)]
pub struct JobDetailResponse {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub state: JobState,
    pub coordinates: Vec<BoundingBox>,
    pub is_face_detected: bool,
    pub processed_filename: Option<String>,
}

impl From<Job> for JobDetailResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            created_at: job.created_at,
            modified_at: job.modified_at,
            state: job.state,
            coordinates: job.coordinates,
            is_face_detected: job.is_face_detected,
            processed_filename: job.processed_filename,
        }
    }
}

/// Body returned with non-success job responses.
#[derive(Debug, Serialize)]
pub struct ReasonResponse {
    pub reason: String,
}
