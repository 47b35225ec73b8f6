use std::sync::Arc;

use crate::config::{AppConfig, BlobBackend, PipelineSettings};
use crate::db;
use crate::services::{
    repository::{JobRepository, PgJobRepository},
    storage::{BlobStore, DirBlobStore, R2BlobStore, StorageError},
    stream::{StreamBackend, StreamError},
};

/// Dependencies shared by the API server and the workers.
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn JobRepository>,
    pub storage: Arc<dyn BlobStore>,
    pub streams: StreamBackend,
    pub settings: Arc<PipelineSettings>,
}

impl AppState {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        storage: Arc<dyn BlobStore>,
        streams: StreamBackend,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            repository,
            storage,
            streams,
            settings: Arc::new(settings),
        }
    }

    /// Connect the PostgreSQL job store (running migrations), the configured
    /// blob store and the Redis stream backend.
    pub async fn from_config(config: &AppConfig) -> Result<Self, StartupError> {
        tracing::info!("Connecting to PostgreSQL database");
        let pool = db::init_pool(&config.database_url).await?;

        tracing::info!("Running database migrations");
        db::run_migrations(&pool).await?;

        let storage: Arc<dyn BlobStore> = match (config.blob_backend, config.r2()) {
            (BlobBackend::R2, Some((bucket, endpoint, access_key, secret_key))) => {
                tracing::info!(bucket, "Initializing R2 blob store");
                Arc::new(R2BlobStore::new(bucket, endpoint, access_key, secret_key)?)
            }
            (BlobBackend::R2, None) => {
                return Err(StorageError::Config("incomplete R2 settings".to_string()).into())
            }
            (BlobBackend::Dir, _) => {
                tracing::info!(root = %config.blob_dir, "Initializing directory blob store");
                Arc::new(DirBlobStore::new(&config.blob_dir))
            }
        };

        let settings = config.pipeline();
        tracing::info!("Connecting to Redis streams");
        let streams = StreamBackend::redis(&config.redis_url, settings.claim_policy())?;

        Ok(Self::new(
            Arc::new(PgJobRepository::new(pool)),
            storage,
            streams,
            settings,
        ))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Blob store error: {0}")]
    Storage(#[from] StorageError),

    #[error("Stream backend error: {0}")]
    Stream(#[from] StreamError),
}
