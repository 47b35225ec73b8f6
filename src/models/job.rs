use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// State of a face detection job.
///
/// `Pending` is set before the job is enqueued; `Finished` and `Error` are
/// terminal and only a worker moves a job into them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Pending,
    Finished,
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Pending)
    }
}

/// A face bounding box as `[x, y, w, h]` in pixels of the original image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }
}

impl From<[i32; 4]> for BoundingBox {
    fn from([x, y, w, h]: [i32; 4]) -> Self {
        Self { x, y, w, h }
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x, b.y, b.w, b.h]
    }
}

/// A face detection job record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub state: JobState,
    pub origin_filename: String,
    pub processed_filename: Option<String>,
    pub is_face_detected: bool,
    pub coordinates: Vec<BoundingBox>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Job {
    /// A fresh `Pending` job for an image already stored under `origin_filename`.
    pub fn new(origin_filename: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            state: JobState::Pending,
            origin_filename: origin_filename.into(),
            processed_filename: None,
            is_face_detected: false,
            coordinates: Vec::new(),
            created_at: now,
            modified_at: now,
        }
    }

    /// `Pending -> Finished`. A processed filename is recorded only together
    /// with at least one face.
    pub fn finish(
        &mut self,
        coordinates: Vec<BoundingBox>,
        processed_filename: Option<String>,
    ) -> Result<(), JobError> {
        self.ensure_pending(JobState::Finished)?;

        match processed_filename {
            Some(filename) if !coordinates.is_empty() => {
                self.is_face_detected = true;
                self.processed_filename = Some(filename);
                self.coordinates = coordinates;
            }
            Some(_) => return Err(JobError::ArtifactWithoutFaces(self.id)),
            None if !coordinates.is_empty() => {
                return Err(JobError::FacesWithoutArtifact(self.id))
            }
            None => {}
        }

        self.state = JobState::Finished;
        self.modified_at = Utc::now();
        Ok(())
    }

    /// `Pending -> Error`.
    pub fn fail(&mut self) -> Result<(), JobError> {
        self.ensure_pending(JobState::Error)?;
        self.state = JobState::Error;
        self.modified_at = Utc::now();
        Ok(())
    }

    fn ensure_pending(&self, to: JobState) -> Result<(), JobError> {
        if self.state.is_terminal() {
            return Err(JobError::InvalidTransition {
                job_id: self.id,
                from: self.state,
                to,
            });
        }
        Ok(())
    }
}

/// Payload of a job stream entry: a reference to the job, never its state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRef {
    pub id: Uuid,
}

impl From<&Job> for JobRef {
    fn from(job: &Job) -> Self {
        Self { id: job.id }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },

    #[error("Job {0} has faces but no processed image")]
    FacesWithoutArtifact(Uuid),

    #[error("Job {0} has a processed image but no faces")]
    ArtifactWithoutFaces(Uuid),
}
