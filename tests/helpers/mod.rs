//! Shared fixtures for pipeline and API tests: an in-process pipeline and
//! synthetic images.
#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{ImageFormat, Rgb, RgbImage};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use face_jobs::{
    app_state::AppState,
    config::PipelineSettings,
    models::job::{Job, JobState},
    routes::{self, ApiState},
    services::{
        detector::SkinToneDetector,
        jobs::JobService,
        repository::{JobRepository, MemoryJobRepository},
        storage::{BlobStore, MemoryBlobStore},
        stream::{memory::MemoryStreams, StreamBackend},
        worker::WorkerPool,
    },
};

pub const SKIN: Rgb<u8> = Rgb([224, 172, 140]);
pub const BACKGROUND: Rgb<u8> = Rgb([30, 60, 200]);

/// PNG of a plain background with a skin-coloured rectangle per face.
pub fn png_with_faces(faces: &[(u32, u32, u32, u32)]) -> Vec<u8> {
    let mut img = RgbImage::from_pixel(240, 200, BACKGROUND);
    for &(x, y, w, h) in faces {
        for py in y..y + h {
            for px in x..x + w {
                img.put_pixel(px, py, SKIN);
            }
        }
    }
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .expect("encode test image");
    out
}

pub fn fast_settings(worker_pool_size: usize) -> PipelineSettings {
    PipelineSettings {
        worker_pool_size,
        poll_block: Duration::from_millis(20),
        idle_interval: Duration::from_millis(5),
        retry_backoff: Duration::from_millis(5),
        listener_interval: Duration::from_millis(20),
        listener_block: Duration::from_millis(5),
        ..PipelineSettings::default()
    }
}

/// Whole pipeline on in-process backends.
pub struct Pipeline {
    pub state: AppState,
    pub repository: Arc<MemoryJobRepository>,
    pub storage: Arc<MemoryBlobStore>,
    pub streams: Arc<MemoryStreams>,
    pub cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(worker_pool_size: usize) -> Self {
        Self::with_settings(fast_settings(worker_pool_size))
    }

    pub fn with_settings(settings: PipelineSettings) -> Self {
        let repository = Arc::new(MemoryJobRepository::new());
        let storage = Arc::new(MemoryBlobStore::new());
        let streams = Arc::new(MemoryStreams::new(Duration::from_secs(60)));
        let state = AppState::new(
            repository.clone(),
            storage.clone(),
            StreamBackend::Memory(streams.clone()),
            settings,
        );
        Self {
            state,
            repository,
            storage,
            streams,
            cancel: CancellationToken::new(),
        }
    }

    pub async fn job_service(&self) -> JobService {
        JobService::connect(&self.state)
            .await
            .expect("connect job service")
    }

    /// Start the worker pool. Shutting the pool down leaves the server running.
    pub async fn start_workers(&self) -> WorkerPool {
        WorkerPool::start(
            &self.state,
            Arc::new(SkinToneDetector::default()),
            self.cancel.child_token(),
        )
        .await
        .expect("start worker pool")
    }

    pub async fn job(&self, id: Uuid) -> Job {
        self.repository.get(id).await.expect("job exists")
    }

    /// Poll until every job in `ids` is terminal or `timeout` elapses.
    pub async fn wait_terminal(&self, ids: &[Uuid], timeout: Duration) -> Vec<Job> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut jobs = Vec::with_capacity(ids.len());
            for id in ids {
                jobs.push(self.job(*id).await);
            }
            if jobs.iter().all(|j| j.state.is_terminal()) || Instant::now() > deadline {
                return jobs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the notification stream holds at least `count` events.
    pub async fn wait_notifications(&self, count: usize, timeout: Duration) {
        let stream = self.streams.get(&self.state.settings.notification_stream).await;
        let deadline = Instant::now() + timeout;
        while stream.len().await < count && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn pending_jobs(&self) -> usize {
        self.repository
            .all()
            .await
            .iter()
            .filter(|j| j.state == JobState::Pending)
            .count()
    }

    /// Remove a stored origin image, as if it was lost before processing.
    pub async fn lose_origin(&self, job: &Job) {
        self.storage
            .delete(&job.origin_filename, &self.state.settings.origin_bucket)
            .await
            .expect("delete origin");
    }

    /// Serve the API on an ephemeral port; returns its base URL.
    pub async fn spawn_server(&self) -> String {
        let jobs = self.job_service().await;
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let app = routes::router(
            ApiState::new(self.state.clone(), jobs, self.cancel.clone()),
            Arc::new(handle),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
                .expect("test server");
        });

        format!("http://{}", addr)
    }
}
