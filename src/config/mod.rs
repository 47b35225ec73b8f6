use std::time::Duration;

use garde::Validate;
use serde::Deserialize;

use crate::services::stream::redis::ClaimPolicy;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlobBackend {
    Dir,
    R2,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8000"). Unused by worker processes.
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// PostgreSQL connection string
    #[garde(length(min = 1))]
    pub database_url: String,

    /// Redis connection string for the job and notification streams
    #[garde(length(min = 1))]
    pub redis_url: String,

    /// Where original and processed images live
    #[serde(default = "default_blob_backend")]
    #[garde(skip)]
    pub blob_backend: BlobBackend,

    /// Root directory of the `dir` blob backend
    #[serde(default = "default_blob_dir")]
    #[garde(length(min = 1))]
    pub blob_dir: String,

    /// R2 bucket name (`r2` blob backend)
    #[garde(skip)]
    pub r2_bucket: Option<String>,

    /// R2 endpoint URL
    #[garde(skip)]
    pub r2_endpoint: Option<String>,

    /// R2 access key ID (S3-compatible)
    #[garde(skip)]
    pub r2_access_key: Option<String>,

    /// R2 secret access key (S3-compatible)
    #[garde(skip)]
    pub r2_secret_key: Option<String>,

    #[serde(default = "default_origin_bucket")]
    #[garde(length(min = 1))]
    pub origin_bucket: String,

    #[serde(default = "default_processed_bucket")]
    #[garde(length(min = 1))]
    pub processed_bucket: String,

    /// URL path prefix processed images are served under, e.g. `/static`
    #[serde(default = "default_static_root")]
    #[garde(length(min = 1), custom(url_path))]
    pub static_root: String,

    #[serde(default = "default_job_stream")]
    #[garde(length(min = 1))]
    pub job_stream: String,

    #[serde(default = "default_notification_stream")]
    #[garde(length(min = 1))]
    pub notification_stream: String,

    #[serde(default = "default_consumer_group")]
    #[garde(length(min = 1))]
    pub consumer_group: String,

    /// Consumer names are `<prefix>-<index>`; keep them stable across
    /// restarts so a restarted worker picks up its own unacknowledged entries.
    #[serde(default = "default_consumer_prefix")]
    #[garde(length(min = 1))]
    pub consumer_prefix: String,

    #[serde(default = "default_worker_pool_size")]
    #[garde(range(min = 1, max = 64))]
    pub worker_pool_size: usize,

    /// How long a worker blocks waiting for a new job entry
    #[serde(default = "default_poll_block_ms")]
    #[garde(range(min = 1, max = 60_000))]
    pub poll_block_ms: u64,

    /// Pause between polls that returned nothing
    #[serde(default = "default_idle_interval_ms")]
    #[garde(range(max = 60_000))]
    pub idle_interval_ms: u64,

    /// Idle time after which another consumer may take over an entry
    #[serde(default = "default_claim_idle_ms")]
    #[garde(range(min = 1))]
    pub claim_idle_ms: u64,

    /// Pending entries inspected per page when looking for one to take over
    #[serde(default = "default_claim_batch")]
    #[garde(range(min = 1, max = 10_000))]
    pub claim_batch: usize,

    /// Deliveries after which a failing job is marked as error
    #[serde(default = "default_max_deliveries")]
    #[garde(range(min = 1))]
    pub max_deliveries: u64,

    /// Pause after an unclassified processing failure
    #[serde(default = "default_retry_backoff_ms")]
    #[garde(skip)]
    pub retry_backoff_ms: u64,

    /// Timer-driven poll interval of live listeners
    #[serde(default = "default_listener_interval_ms")]
    #[garde(range(min = 1))]
    pub listener_interval_ms: u64,

    /// How long a single listener poll blocks on the notification stream
    #[serde(default = "default_listener_block_ms")]
    #[garde(skip)]
    pub listener_block_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_blob_backend() -> BlobBackend {
    BlobBackend::Dir
}

fn default_blob_dir() -> String {
    "./data".to_string()
}

fn default_origin_bucket() -> String {
    "origin".to_string()
}

fn default_processed_bucket() -> String {
    "processed".to_string()
}

fn default_static_root() -> String {
    "/static".to_string()
}

fn url_path(value: &str, _ctx: &()) -> garde::Result {
    if value.starts_with('/') {
        Ok(())
    } else {
        Err(garde::Error::new("must be a path starting with '/'"))
    }
}

fn default_job_stream() -> String {
    "process".to_string()
}

fn default_notification_stream() -> String {
    "ws".to_string()
}

fn default_consumer_group() -> String {
    "process_group".to_string()
}

fn default_consumer_prefix() -> String {
    "face-worker".to_string()
}

fn default_worker_pool_size() -> usize {
    3
}

fn default_poll_block_ms() -> u64 {
    1000
}

fn default_idle_interval_ms() -> u64 {
    250
}

fn default_claim_idle_ms() -> u64 {
    60_000
}

fn default_claim_batch() -> usize {
    100
}

fn default_max_deliveries() -> u64 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_listener_interval_ms() -> u64 {
    1000
}

fn default_listener_block_ms() -> u64 {
    10
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        if config.blob_backend == BlobBackend::R2 && config.r2().is_none() {
            return Err(ConfigError::MissingR2);
        }
        Ok(config)
    }

    /// `(bucket, endpoint, access_key, secret_key)` when all R2 settings are present.
    pub fn r2(&self) -> Option<(&str, &str, &str, &str)> {
        Some((
            self.r2_bucket.as_deref()?,
            self.r2_endpoint.as_deref()?,
            self.r2_access_key.as_deref()?,
            self.r2_secret_key.as_deref()?,
        ))
    }

    pub fn pipeline(&self) -> PipelineSettings {
        PipelineSettings {
            job_stream: self.job_stream.clone(),
            notification_stream: self.notification_stream.clone(),
            consumer_group: self.consumer_group.clone(),
            consumer_prefix: self.consumer_prefix.clone(),
            worker_pool_size: self.worker_pool_size,
            poll_block: Duration::from_millis(self.poll_block_ms),
            idle_interval: Duration::from_millis(self.idle_interval_ms),
            claim_idle: Duration::from_millis(self.claim_idle_ms),
            claim_batch: self.claim_batch,
            max_deliveries: self.max_deliveries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            listener_interval: Duration::from_millis(self.listener_interval_ms),
            listener_block: Duration::from_millis(self.listener_block_ms),
            origin_bucket: self.origin_bucket.clone(),
            processed_bucket: self.processed_bucket.clone(),
            static_root: self.static_root.clone(),
        }
    }
}

/// Settings of the job pipeline shared by the producer, workers and listeners.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub job_stream: String,
    pub notification_stream: String,
    pub consumer_group: String,
    pub consumer_prefix: String,
    pub worker_pool_size: usize,
    pub poll_block: Duration,
    pub idle_interval: Duration,
    pub claim_idle: Duration,
    pub claim_batch: usize,
    pub max_deliveries: u64,
    pub retry_backoff: Duration,
    pub listener_interval: Duration,
    pub listener_block: Duration,
    pub origin_bucket: String,
    pub processed_bucket: String,
    pub static_root: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            job_stream: default_job_stream(),
            notification_stream: default_notification_stream(),
            consumer_group: default_consumer_group(),
            consumer_prefix: default_consumer_prefix(),
            worker_pool_size: default_worker_pool_size(),
            poll_block: Duration::from_millis(default_poll_block_ms()),
            idle_interval: Duration::from_millis(default_idle_interval_ms()),
            claim_idle: Duration::from_millis(default_claim_idle_ms()),
            claim_batch: default_claim_batch(),
            max_deliveries: default_max_deliveries(),
            retry_backoff: Duration::from_millis(default_retry_backoff_ms()),
            listener_interval: Duration::from_millis(default_listener_interval_ms()),
            listener_block: Duration::from_millis(default_listener_block_ms()),
            origin_bucket: default_origin_bucket(),
            processed_bucket: default_processed_bucket(),
            static_root: default_static_root(),
        }
    }
}

impl PipelineSettings {
    pub fn consumer_name(&self, index: usize) -> String {
        format!("{}-{}", self.consumer_prefix, index)
    }

    pub fn claim_policy(&self) -> ClaimPolicy {
        ClaimPolicy {
            idle: self.claim_idle,
            batch: self.claim_batch,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),

    #[error("BLOB_BACKEND=r2 requires R2_BUCKET, R2_ENDPOINT, R2_ACCESS_KEY and R2_SECRET_KEY")]
    MissingR2,
}
