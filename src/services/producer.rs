use std::sync::Arc;

use uuid::Uuid;

use crate::models::job::{Job, JobRef, JobState};
use crate::services::stream::{codec, DurableStream, EntryId, StreamError};

/// Appends references to persisted jobs onto the job stream.
pub struct JobProducer {
    stream: Arc<dyn DurableStream>,
}

impl JobProducer {
    pub fn new(stream: Arc<dyn DurableStream>) -> Self {
        Self { stream }
    }

    /// Enqueue a persisted `Pending` job. On failure the job stays `Pending`
    /// without ever reaching a worker, so the error must reach the caller.
    pub async fn submit(&self, job: &Job) -> Result<EntryId, ProducerError> {
        if job.state != JobState::Pending {
            return Err(ProducerError::NotPending {
                job_id: job.id,
                state: job.state,
            });
        }
        if job.origin_filename.is_empty() {
            return Err(ProducerError::MissingOrigin(job.id));
        }

        let payload = codec::encode(&JobRef::from(job))?;
        match self.stream.append(&payload).await {
            Ok(entry_id) => {
                metrics::counter!("face_jobs_submitted_total").increment(1);
                tracing::info!(
                    job_id = %job.id,
                    entry_id = %entry_id,
                    stream = %self.stream.name(),
                    "Job enqueued"
                );
                Ok(entry_id)
            }
            Err(e) => {
                metrics::counter!("face_jobs_enqueue_failed_total").increment(1);
                tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue job, it stays pending");
                Err(e.into())
            }
        }
    }

    /// Reachability of the job stream, over the producer's own handle.
    pub async fn health_check(&self) -> Result<(), StreamError> {
        self.stream.health_check().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("Job {job_id} is {state}, only pending jobs are enqueued")]
    NotPending { job_id: Uuid, state: JobState },

    #[error("Job {0} has no origin file")]
    MissingOrigin(Uuid),

    #[error(transparent)]
    Stream(#[from] StreamError),
}
