use std::sync::Arc;

use uuid::Uuid;

use crate::app_state::AppState;
use crate::config::PipelineSettings;
use crate::models::job::{Job, JobState};
use crate::services::producer::{JobProducer, ProducerError};
use crate::services::repository::{JobRepository, RepositoryError};
use crate::services::storage::{BlobStore, StorageError};
use crate::services::stream::StreamError;

/// Entry point of the API for submitting images and reading results.
pub struct JobService {
    repository: Arc<dyn JobRepository>,
    storage: Arc<dyn BlobStore>,
    producer: JobProducer,
    settings: Arc<PipelineSettings>,
}

impl JobService {
    pub fn new(state: &AppState, producer: JobProducer) -> Self {
        Self {
            repository: state.repository.clone(),
            storage: state.storage.clone(),
            producer,
            settings: state.settings.clone(),
        }
    }

    /// Service with a producer on the configured job stream.
    pub async fn connect(state: &AppState) -> Result<Self, StreamError> {
        let stream = state.streams.open(&state.settings.job_stream).await?;
        Ok(Self::new(state, JobProducer::new(stream)))
    }

    /// Job stream reachability, checked on the producer's connection.
    pub async fn stream_health(&self) -> Result<(), StreamError> {
        self.producer.health_check().await
    }

    /// Store an uploaded image, persist a `Pending` job for it and enqueue it.
    ///
    /// The stored blob is named after the detected image format, not the
    /// client's file name.
    pub async fn create_job(
        &self,
        data: &[u8],
        content_type: Option<&str>,
    ) -> Result<Job, ServiceError> {
        if !content_type.is_some_and(|ct| ct.starts_with("image/")) {
            return Err(ServiceError::Validation(
                "invalid file, not an image or invalid content type".to_string(),
            ));
        }
        let format = image::guess_format(data)
            .map_err(|_| ServiceError::Validation("unrecognised image format".to_string()))?;
        let ext = format
            .extensions_str()
            .first()
            .ok_or_else(|| ServiceError::Validation("unsupported image format".to_string()))?;

        let origin_filename = self
            .storage
            .save(data, &format!("upload.{}", ext), &self.settings.origin_bucket)
            .await?;

        let job = Job::new(origin_filename);
        if let Err(e) = self.repository.save(&job).await {
            if let Err(cleanup) = self
                .storage
                .delete(&job.origin_filename, &self.settings.origin_bucket)
                .await
            {
                tracing::warn!(
                    job_id = %job.id,
                    error = %cleanup,
                    "Failed to remove origin image of unsaved job"
                );
            }
            return Err(e.into());
        }

        self.producer.submit(&job).await?;

        tracing::info!(job_id = %job.id, origin = %job.origin_filename, "Job created");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job, ServiceError> {
        Ok(self.repository.get(job_id).await?)
    }

    /// Annotated image of a finished job with faces.
    pub async fn processed_image(&self, job_id: Uuid) -> Result<Vec<u8>, ServiceError> {
        let job = self.get_job(job_id).await?;

        match job.state {
            JobState::Pending => return Err(ServiceError::NotFinished(job_id)),
            JobState::Error => return Err(ServiceError::Failed(job_id)),
            JobState::Finished => {}
        }

        let Some(filename) = job.processed_filename.as_deref() else {
            return Err(ServiceError::MissingArtifact(job_id));
        };

        match self
            .storage
            .retrieve(filename, &self.settings.processed_bucket)
            .await
        {
            Ok(bytes) => Ok(bytes),
            Err(StorageError::NotFound(_)) => {
                tracing::error!(job_id = %job_id, filename, "Processed image missing from storage");
                Err(ServiceError::MissingArtifact(job_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Processed image by file name, as linked from notifications.
    pub async fn static_image(&self, filename: &str) -> Result<Vec<u8>, ServiceError> {
        match self
            .storage
            .retrieve(filename, &self.settings.processed_bucket)
            .await
        {
            Err(StorageError::NotFound(_) | StorageError::InvalidFilename(_)) => {
                Err(ServiceError::FileNotFound(filename.to_string()))
            }
            result => Ok(result?),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("file {0} not found")]
    FileNotFound(String),

    #[error("job not finished")]
    NotFinished(Uuid),

    #[error("job error")]
    Failed(Uuid),

    #[error("processed file does not exist")]
    MissingArtifact(Uuid),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("job store error: {0}")]
    Repository(RepositoryError),

    #[error("failed to enqueue job: {0}")]
    Producer(#[from] ProducerError),
}

impl From<RepositoryError> for ServiceError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => ServiceError::NotFound(id),
            other => ServiceError::Repository(other),
        }
    }
}
