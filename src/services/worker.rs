//! Job stream consumers.
//!
//! Every [`Worker`] is one consumer of the shared consumer group on the job
//! stream. The group guarantees that an unacknowledged entry is held by a
//! single worker, so workers never coordinate with each other. An entry is
//! acknowledged only once its job has reached a terminal state or the entry
//! is known to be unprocessable.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::config::PipelineSettings;
use crate::models::job::{Job, JobError, JobRef, JobState};
use crate::services::detector::{Detection, Detector, DetectorError, ANNOTATED_EXTENSION};
use crate::services::notifications::Notifier;
use crate::services::repository::{JobRepository, RepositoryError};
use crate::services::storage::{BlobStore, StorageError};
use crate::services::stream::{codec, DurableStream, Entry, StreamError};

/// Terminal result of one claimed entry. Every outcome has been acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The job was processed and is now `Finished`.
    Finished {
        job_id: Uuid,
        faces: usize,
        notified: bool,
    },
    /// The job's image was missing or undecodable; the job is now `Error`.
    Failed { job_id: Uuid, reason: String },
    /// The job was already terminal (redelivery); nothing was redone.
    AlreadyTerminal { job_id: Uuid, state: JobState },
    /// The entry could not be resolved to a job and was discarded.
    Dropped { reason: String },
    /// Processing kept failing; the job was marked `Error` and the entry discarded.
    DeadLettered { job_id: Option<Uuid>, deliveries: u64 },
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Finished { .. } => "finished",
            Outcome::Failed { .. } => "failed",
            Outcome::AlreadyTerminal { .. } => "already_terminal",
            Outcome::Dropped { .. } => "dropped",
            Outcome::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// Failure that left the entry unacknowledged. It will be redelivered to the
/// same worker until it succeeds or is dead-lettered.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Job store error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Blob store error: {0}")]
    Storage(#[from] StorageError),

    #[error("Detector error: {0}")]
    Detector(#[from] DetectorError),

    #[error("Job state error: {0}")]
    Job(#[from] JobError),

    #[error("Detector task failed: {0}")]
    DetectorTask(#[from] tokio::task::JoinError),
}

pub struct Worker {
    consumer: String,
    jobs: Arc<dyn DurableStream>,
    notifier: Notifier,
    repository: Arc<dyn JobRepository>,
    storage: Arc<dyn BlobStore>,
    detector: Arc<dyn Detector>,
    settings: Arc<PipelineSettings>,
}

impl Worker {
    pub fn new(
        consumer: impl Into<String>,
        state: &AppState,
        jobs: Arc<dyn DurableStream>,
        notifier: Notifier,
        detector: Arc<dyn Detector>,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            jobs,
            notifier,
            repository: state.repository.clone(),
            storage: state.storage.clone(),
            detector,
            settings: state.settings.clone(),
        }
    }

    /// Worker number `index`, with its own job and notification stream handles.
    pub async fn connect(
        index: usize,
        state: &AppState,
        detector: Arc<dyn Detector>,
    ) -> Result<Self, StreamError> {
        let jobs = state.streams.open(&state.settings.job_stream).await?;
        let notifications = state.streams.open(&state.settings.notification_stream).await?;
        let notifier = Notifier::new(notifications, state.settings.static_root.clone());
        Ok(Self::new(
            state.settings.consumer_name(index),
            state,
            jobs,
            notifier,
            detector,
        ))
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Poll until `cancel` fires. Cancellation is observed between jobs only.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(consumer = %self.consumer, "Worker started");

        while !cancel.is_cancelled() {
            let pause = match self.step().await {
                Ok(Some(outcome)) => {
                    tracing::debug!(consumer = %self.consumer, ?outcome, "Entry handled");
                    continue;
                }
                Ok(None) => {
                    tracing::trace!(consumer = %self.consumer, "No jobs available");
                    self.settings.idle_interval
                }
                Err(e) => {
                    tracing::warn!(
                        consumer = %self.consumer,
                        error = %e,
                        backoff_ms = self.settings.retry_backoff.as_millis() as u64,
                        "Worker iteration failed, backing off"
                    );
                    self.settings.retry_backoff
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        tracing::info!(consumer = %self.consumer, "Worker stopped");
    }

    /// Claim and handle at most one entry.
    ///
    /// `Ok(None)` means nothing was available within the poll block. An
    /// `Err` leaves the claimed entry (if any) unacknowledged.
    pub async fn step(&self) -> Result<Option<Outcome>, ProcessError> {
        let Some(entry) = self
            .jobs
            .read_next(
                &self.settings.consumer_group,
                &self.consumer,
                self.settings.poll_block,
            )
            .await?
        else {
            return Ok(None);
        };

        tracing::debug!(
            consumer = %self.consumer,
            entry_id = %entry.id,
            deliveries = entry.deliveries,
            "Claimed job entry"
        );

        match self.process_entry(&entry).await {
            Ok(outcome) => {
                metrics::counter!("face_jobs_processed_total", "outcome" => outcome.label())
                    .increment(1);
                Ok(Some(outcome))
            }
            Err(e) => self.handle_failure(&entry, e).await,
        }
    }

    /// Move the job referenced by `entry` to a terminal state and acknowledge.
    pub async fn process_entry(&self, entry: &Entry) -> Result<Outcome, ProcessError> {
        let job_ref = match codec::decode::<JobRef>(&entry.payload) {
            Ok(job_ref) => job_ref,
            Err(e) => {
                tracing::warn!(entry_id = %entry.id, error = %e, "Dropping malformed job entry");
                return self.drop_entry(entry, format!("malformed payload: {}", e)).await;
            }
        };

        let mut job = match self.repository.get(job_ref.id).await {
            Ok(job) => job,
            Err(RepositoryError::NotFound(id)) => {
                tracing::warn!(entry_id = %entry.id, job_id = %id, "Dropping entry for unknown job");
                return self.drop_entry(entry, format!("unknown job {}", id)).await;
            }
            Err(e) => return Err(e.into()),
        };

        if job.state.is_terminal() {
            tracing::info!(
                job_id = %job.id,
                state = %job.state,
                "Job already terminal, acknowledging redelivered entry"
            );
            self.ack(entry).await?;
            return Ok(Outcome::AlreadyTerminal {
                job_id: job.id,
                state: job.state,
            });
        }

        tracing::info!(job_id = %job.id, origin = %job.origin_filename, "Processing face job");

        let image = match self
            .storage
            .retrieve(&job.origin_filename, &self.settings.origin_bucket)
            .await
        {
            Ok(image) => image,
            Err(e @ (StorageError::NotFound(_) | StorageError::InvalidFilename(_))) => {
                return self.fail_job(entry, &mut job, e.to_string()).await;
            }
            Err(e) => return Err(e.into()),
        };

        let detection = match self.detect(image).await? {
            Ok(detection) => detection,
            Err(e) if e.is_recoverable() => {
                return self.fail_job(entry, &mut job, e.to_string()).await;
            }
            Err(e) => return Err(e.into()),
        };

        let faces = detection.boxes.len();
        let processed_filename = match detection.annotated.as_deref() {
            Some(annotated) => Some(
                self.storage
                    .save(
                        annotated,
                        &format!("annotated.{}", ANNOTATED_EXTENSION),
                        &self.settings.processed_bucket,
                    )
                    .await?,
            ),
            None => None,
        };

        job.finish(detection.boxes, processed_filename)?;
        self.repository.update(&job).await?;

        // The job is terminal from here on; a redelivery would not notify.
        let notified = self.notify(&job).await?;
        self.ack(entry).await?;

        tracing::info!(job_id = %job.id, faces, notified, "Job finished");
        Ok(Outcome::Finished {
            job_id: job.id,
            faces,
            notified,
        })
    }

    /// Run the detector on the blocking pool so sibling workers keep polling.
    async fn detect(&self, image: Vec<u8>) -> Result<Result<Detection, DetectorError>, ProcessError> {
        let detector = self.detector.clone();
        let started = Instant::now();
        let result = tokio::task::spawn_blocking(move || detector.detect(&image)).await?;
        metrics::histogram!("face_detection_seconds").record(started.elapsed().as_secs_f64());
        Ok(result)
    }

    /// Publish the completion event, retrying in place up to
    /// `max_deliveries` attempts.
    async fn notify(&self, job: &Job) -> Result<bool, StreamError> {
        let mut attempt = 1;
        loop {
            match self.notifier.publish(job).await {
                Ok(entry_id) => return Ok(entry_id.is_some()),
                Err(e) if attempt < self.settings.max_deliveries => {
                    tracing::warn!(
                        job_id = %job.id,
                        attempt,
                        error = %e,
                        "Notification publish failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.settings.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fail_job(&self, entry: &Entry, job: &mut Job, reason: String) -> Result<Outcome, ProcessError> {
        tracing::warn!(job_id = %job.id, reason = %reason, "Face detection failed, marking job as error");
        job.fail()?;
        self.repository.update(job).await?;
        self.ack(entry).await?;
        Ok(Outcome::Failed {
            job_id: job.id,
            reason,
        })
    }

    async fn drop_entry(&self, entry: &Entry, reason: String) -> Result<Outcome, ProcessError> {
        self.ack(entry).await?;
        Ok(Outcome::Dropped { reason })
    }

    async fn ack(&self, entry: &Entry) -> Result<(), StreamError> {
        self.jobs.ack(&self.settings.consumer_group, entry.id).await
    }

    /// Record an unclassified failure. Below `max_deliveries` the entry is
    /// left for redelivery; at the limit the job is marked `Error` and the
    /// entry acknowledged.
    async fn handle_failure(
        &self,
        entry: &Entry,
        error: ProcessError,
    ) -> Result<Option<Outcome>, ProcessError> {
        metrics::counter!("face_jobs_retried_total").increment(1);
        tracing::error!(
            consumer = %self.consumer,
            entry_id = %entry.id,
            deliveries = entry.deliveries,
            max_deliveries = self.settings.max_deliveries,
            error = %error,
            "Job processing failed"
        );

        if entry.deliveries < self.settings.max_deliveries {
            return Err(error);
        }

        let outcome = self.dead_letter(entry).await?;
        metrics::counter!("face_jobs_processed_total", "outcome" => outcome.label()).increment(1);
        Ok(Some(outcome))
    }

    async fn dead_letter(&self, entry: &Entry) -> Result<Outcome, ProcessError> {
        let job_id = codec::decode::<JobRef>(&entry.payload).ok().map(|r| r.id);

        if let Some(id) = job_id {
            match self.repository.get(id).await {
                Ok(mut job) if !job.state.is_terminal() => {
                    job.fail()?;
                    self.repository.update(&job).await?;
                }
                Ok(_) | Err(RepositoryError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.ack(entry).await?;
        tracing::error!(
            entry_id = %entry.id,
            job_id = ?job_id,
            deliveries = entry.deliveries,
            "Job dead-lettered after repeated failures"
        );
        Ok(Outcome::DeadLettered {
            job_id,
            deliveries: entry.deliveries,
        })
    }
}

/// Fixed-size set of workers sharing one consumer group.
pub struct WorkerPool {
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Create the consumer group, then connect and spawn
    /// `settings.worker_pool_size` workers.
    pub async fn start(
        state: &AppState,
        detector: Arc<dyn Detector>,
        cancel: CancellationToken,
    ) -> Result<Self, StreamError> {
        let jobs = state.streams.open(&state.settings.job_stream).await?;
        jobs.create_consumer_group(&state.settings.consumer_group).await?;

        let mut workers = Vec::with_capacity(state.settings.worker_pool_size);
        for index in 0..state.settings.worker_pool_size {
            workers.push(Worker::connect(index, state, detector.clone()).await?);
        }

        Ok(Self::spawn(workers, cancel))
    }

    /// Spawn already connected workers. Their consumer group must exist.
    pub fn spawn(workers: Vec<Worker>, cancel: CancellationToken) -> Self {
        let mut tasks = JoinSet::new();
        for worker in workers {
            tasks.spawn(worker.run(cancel.clone()));
        }
        tracing::info!(workers = tasks.len(), "Worker pool started");
        Self { tasks, cancel }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Ask every worker to stop after its current job and wait for them.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.wait().await;
    }

    /// Wait for every worker to stop.
    pub async fn wait(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::BoundingBox;
    use crate::services::detector::tests::png_with_faces;
    use crate::services::detector::SkinToneDetector;
    use crate::services::repository::MemoryJobRepository;
    use crate::services::storage::MemoryBlobStore;
    use crate::services::stream::memory::MemoryStreams;
    use crate::services::stream::{EntryId, StreamBackend};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixture {
        state: AppState,
        repository: Arc<MemoryJobRepository>,
        storage: Arc<dyn BlobStore>,
        streams: Arc<MemoryStreams>,
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            poll_block: Duration::from_millis(5),
            idle_interval: Duration::from_millis(5),
            retry_backoff: Duration::from_millis(5),
            max_deliveries: 3,
            ..PipelineSettings::default()
        }
    }

    async fn fixture(storage: Arc<dyn BlobStore>) -> Fixture {
        let repository = Arc::new(MemoryJobRepository::new());
        let streams = Arc::new(MemoryStreams::new(Duration::from_secs(60)));
        let state = AppState::new(
            repository.clone(),
            storage.clone(),
            StreamBackend::Memory(streams.clone()),
            settings(),
        );
        let jobs = state.streams.open("process").await.unwrap();
        jobs.create_consumer_group("process_group").await.unwrap();
        Fixture {
            state,
            repository,
            storage,
            streams,
        }
    }

    impl Fixture {
        async fn worker(&self, detector: Arc<dyn Detector>) -> Worker {
            Worker::connect(0, &self.state, detector).await.unwrap()
        }

        async fn submit(&self, image: &[u8]) -> Job {
            let origin = self.storage.save(image, "upload.png", "origin").await.unwrap();
            let job = Job::new(origin);
            self.repository.save(&job).await.unwrap();
            let jobs = self.state.streams.open("process").await.unwrap();
            jobs.append(&codec::encode(&JobRef::from(&job)).unwrap())
                .await
                .unwrap();
            job
        }

        async fn pending(&self) -> usize {
            self.streams.get("process").await.pending_count("process_group").await
        }
    }

    #[tokio::test]
    async fn face_job_finishes_and_notifies() {
        let fx = fixture(Arc::new(MemoryBlobStore::new())).await;
        let worker = fx.worker(Arc::new(SkinToneDetector::default())).await;
        let job = fx.submit(&png_with_faces(&[(50, 40, 60, 80)])).await;

        let outcome = worker.step().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            Outcome::Finished {
                job_id: job.id,
                faces: 1,
                notified: true
            }
        );

        let stored = fx.repository.get(job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Finished);
        assert!(stored.is_face_detected);
        assert_eq!(stored.coordinates, vec![BoundingBox::new(50, 40, 60, 80)]);
        let processed = stored.processed_filename.unwrap();
        assert!(processed.ends_with(".png"));
        assert!(fx.storage.retrieve(&processed, "processed").await.is_ok());

        assert_eq!(fx.streams.get("ws").await.len().await, 1);
        assert_eq!(fx.pending().await, 0);
    }

    #[tokio::test]
    async fn faceless_job_finishes_silently() {
        let fx = fixture(Arc::new(MemoryBlobStore::new())).await;
        let worker = fx.worker(Arc::new(SkinToneDetector::default())).await;
        let job = fx.submit(&png_with_faces(&[])).await;

        let outcome = worker.step().await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Finished { faces: 0, notified: false, .. }));

        let stored = fx.repository.get(job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Finished);
        assert!(!stored.is_face_detected);
        assert!(stored.processed_filename.is_none());
        assert!(fx.streams.get("ws").await.is_empty().await);
    }

    #[tokio::test]
    async fn undecodable_image_marks_job_as_error() {
        let fx = fixture(Arc::new(MemoryBlobStore::new())).await;
        let worker = fx.worker(Arc::new(SkinToneDetector::default())).await;
        let job = fx.submit(b"not an image").await;

        let outcome = worker.step().await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Failed { job_id, .. } if job_id == job.id));
        assert_eq!(fx.repository.get(job.id).await.unwrap().state, JobState::Error);
        assert_eq!(fx.pending().await, 0);
    }

    #[tokio::test]
    async fn missing_origin_marks_job_as_error() {
        let fx = fixture(Arc::new(MemoryBlobStore::new())).await;
        let worker = fx.worker(Arc::new(SkinToneDetector::default())).await;
        let job = fx.submit(&png_with_faces(&[(50, 40, 60, 80)])).await;
        fx.storage.delete(&job.origin_filename, "origin").await.unwrap();

        let outcome = worker.step().await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Failed { .. }));
        assert_eq!(fx.repository.get(job.id).await.unwrap().state, JobState::Error);
        assert!(fx.streams.get("ws").await.is_empty().await);
    }

    #[tokio::test]
    async fn malformed_and_unknown_entries_are_dropped() {
        let fx = fixture(Arc::new(MemoryBlobStore::new())).await;
        let worker = fx.worker(Arc::new(SkinToneDetector::default())).await;
        let jobs = fx.state.streams.open("process").await.unwrap();
        jobs.append("{\"id\": 42}").await.unwrap();
        jobs.append(&codec::encode(&JobRef { id: Uuid::new_v4() }).unwrap())
            .await
            .unwrap();

        for _ in 0..2 {
            let outcome = worker.step().await.unwrap().unwrap();
            assert!(matches!(outcome, Outcome::Dropped { .. }));
        }
        assert_eq!(fx.pending().await, 0);
        assert!(worker.step().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn redelivered_terminal_job_is_not_renotified() {
        let fx = fixture(Arc::new(MemoryBlobStore::new())).await;
        let worker = fx.worker(Arc::new(SkinToneDetector::default())).await;
        let job = fx.submit(&png_with_faces(&[(50, 40, 60, 80)])).await;
        worker.step().await.unwrap();

        // Simulate a crash between persisting and acknowledging.
        let jobs = fx.state.streams.open("process").await.unwrap();
        jobs.append(&codec::encode(&JobRef::from(&job)).unwrap())
            .await
            .unwrap();

        let outcome = worker.step().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            Outcome::AlreadyTerminal {
                job_id: job.id,
                state: JobState::Finished
            }
        );
        assert_eq!(fx.streams.get("ws").await.len().await, 1);
    }

    /// Blob store whose reads fail a fixed number of times before recovering.
    struct FlakyStorage {
        inner: MemoryBlobStore,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl BlobStore for FlakyStorage {
        async fn save(&self, data: &[u8], name: &str, bucket: &str) -> Result<String, StorageError> {
            self.inner.save(data, name, bucket).await
        }

        async fn retrieve(&self, filename: &str, bucket: &str) -> Result<Vec<u8>, StorageError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::Status(503));
            }
            self.inner.retrieve(filename, bucket).await
        }

        async fn delete(&self, filename: &str, bucket: &str) -> Result<(), StorageError> {
            self.inner.delete(filename, bucket).await
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let storage = Arc::new(FlakyStorage {
            inner: MemoryBlobStore::new(),
            failures_left: AtomicUsize::new(0),
        });
        let fx = fixture(storage.clone()).await;
        let worker = fx.worker(Arc::new(SkinToneDetector::default())).await;
        let job = fx.submit(&png_with_faces(&[(50, 40, 60, 80)])).await;
        storage.failures_left.store(1, Ordering::SeqCst);

        assert!(matches!(worker.step().await, Err(ProcessError::Storage(_))));
        assert_eq!(fx.pending().await, 1);
        assert_eq!(fx.repository.get(job.id).await.unwrap().state, JobState::Pending);

        let outcome = worker.step().await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Finished { faces: 1, .. }));
        assert_eq!(fx.pending().await, 0);
    }

    #[tokio::test]
    async fn persistent_failures_are_dead_lettered() {
        let storage = Arc::new(FlakyStorage {
            inner: MemoryBlobStore::new(),
            failures_left: AtomicUsize::new(0),
        });
        let fx = fixture(storage.clone()).await;
        let worker = fx.worker(Arc::new(SkinToneDetector::default())).await;
        let job = fx.submit(&png_with_faces(&[(50, 40, 60, 80)])).await;
        storage.failures_left.store(usize::MAX, Ordering::SeqCst);

        assert!(worker.step().await.is_err());
        assert!(worker.step().await.is_err());
        let outcome = worker.step().await.unwrap().unwrap();

        assert_eq!(
            outcome,
            Outcome::DeadLettered {
                job_id: Some(job.id),
                deliveries: 3
            }
        );
        assert_eq!(fx.repository.get(job.id).await.unwrap().state, JobState::Error);
        assert_eq!(fx.pending().await, 0);
    }

    /// Stream whose appends fail a fixed number of times before recovering.
    struct FlakyAppends {
        inner: Arc<dyn DurableStream>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl DurableStream for FlakyAppends {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn append(&self, payload: &str) -> Result<EntryId, StreamError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                let err = redis::RedisError::from((redis::ErrorKind::IoError, "connection reset"));
                return Err(err.into());
            }
            self.inner.append(payload).await
        }

        async fn create_consumer_group(&self, group: &str) -> Result<(), StreamError> {
            self.inner.create_consumer_group(group).await
        }

        async fn read_next(
            &self,
            group: &str,
            consumer: &str,
            block: Duration,
        ) -> Result<Option<Entry>, StreamError> {
            self.inner.read_next(group, consumer, block).await
        }

        async fn ack(&self, group: &str, id: EntryId) -> Result<(), StreamError> {
            self.inner.ack(group, id).await
        }

        async fn tail(&self, cursor: EntryId, block: Duration) -> Result<Option<Entry>, StreamError> {
            self.inner.tail(cursor, block).await
        }

        async fn last_id(&self) -> Result<EntryId, StreamError> {
            self.inner.last_id().await
        }

        async fn health_check(&self) -> Result<(), StreamError> {
            self.inner.health_check().await
        }
    }

    impl Fixture {
        async fn worker_with_flaky_notifications(&self, failures: usize) -> Worker {
            let jobs = self.state.streams.open("process").await.unwrap();
            let notifications = Arc::new(FlakyAppends {
                inner: self.state.streams.open("ws").await.unwrap(),
                failures_left: AtomicUsize::new(failures),
            });
            Worker::new(
                "face-worker-0",
                &self.state,
                jobs,
                Notifier::new(notifications, "/static"),
                Arc::new(SkinToneDetector::default()),
            )
        }
    }

    #[tokio::test]
    async fn failed_publish_is_retried_before_acknowledging() {
        let fx = fixture(Arc::new(MemoryBlobStore::new())).await;
        let worker = fx.worker_with_flaky_notifications(1).await;
        let job = fx.submit(&png_with_faces(&[(50, 40, 60, 80)])).await;

        let outcome = worker.step().await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Finished { notified: true, .. }));

        let stored = fx.repository.get(job.id).await.unwrap();
        assert!(stored.is_face_detected);
        assert_eq!(fx.streams.get("ws").await.len().await, 1);
        assert_eq!(fx.pending().await, 0);
    }

    #[tokio::test]
    async fn publish_failing_on_every_attempt_keeps_the_entry() {
        let fx = fixture(Arc::new(MemoryBlobStore::new())).await;
        let worker = fx.worker_with_flaky_notifications(usize::MAX).await;
        fx.submit(&png_with_faces(&[(50, 40, 60, 80)])).await;

        assert!(matches!(worker.step().await, Err(ProcessError::Stream(_))));
        assert!(fx.streams.get("ws").await.is_empty().await);
        assert_eq!(fx.pending().await, 1);
    }

    /// Detector that counts calls and always finds one face.
    struct CountingDetector(AtomicUsize);

    impl Detector for CountingDetector {
        fn detect(&self, image_bytes: &[u8]) -> Result<Detection, DetectorError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            SkinToneDetector::default().detect(image_bytes)
        }
    }

    #[tokio::test]
    async fn pool_processes_every_job_once() {
        let fx = fixture(Arc::new(MemoryBlobStore::new())).await;
        let detector = Arc::new(CountingDetector(AtomicUsize::new(0)));
        let image = png_with_faces(&[(50, 40, 60, 80)]);
        let mut submitted = Vec::new();
        for _ in 0..20 {
            submitted.push(fx.submit(&image).await);
        }

        let pool = WorkerPool::start(&fx.state, detector.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(pool.len(), 3);

        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let done = fx
                .repository
                .all()
                .await
                .iter()
                .filter(|j| j.state.is_terminal())
                .count();
            if done == submitted.len() || Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;

        assert_eq!(detector.0.load(Ordering::SeqCst), submitted.len());
        for job in &submitted {
            assert_eq!(fx.repository.get(job.id).await.unwrap().state, JobState::Finished);
        }
        assert_eq!(fx.streams.get("ws").await.len().await, submitted.len());
    }
}
