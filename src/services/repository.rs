use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::queries;
use crate::models::job::Job;

/// Keyed store of job records. The record store is the single source of
/// truth for job state.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn save(&self, job: &Job) -> Result<(), RepositoryError>;

    async fn get(&self, job_id: Uuid) -> Result<Job, RepositoryError>;

    /// Full overwrite by id; fails with `NotFound` when the id is unknown.
    async fn update(&self, job: &Job) -> Result<(), RepositoryError>;

    async fn health_check(&self) -> Result<(), RepositoryError>;
}

/// PostgreSQL-backed job records.
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn save(&self, job: &Job) -> Result<(), RepositoryError> {
        match queries::insert_job(&self.pool, job).await {
            Ok(()) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(RepositoryError::Duplicate(job.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Job, RepositoryError> {
        queries::get_job(&self.pool, job_id)
            .await?
            .ok_or(RepositoryError::NotFound(job_id))
    }

    async fn update(&self, job: &Job) -> Result<(), RepositoryError> {
        match queries::update_job(&self.pool, job).await? {
            0 => Err(RepositoryError::NotFound(job.id)),
            _ => Ok(()),
        }
    }

    async fn health_check(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// In-process job records, for tests and single-process runs.
#[derive(Default)]
pub struct MemoryJobRepository {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn save(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(RepositoryError::Duplicate(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Job, RepositoryError> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(RepositoryError::NotFound(job_id))
    }

    async fn update(&self, job: &Job) -> Result<(), RepositoryError> {
        match self.jobs.write().await.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(job.id)),
        }
    }

    async fn health_check(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {0} already exists")]
    Duplicate(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
