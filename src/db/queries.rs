use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::job::{BoundingBox, Job, JobState};

/// Insert a new face job
pub async fn insert_job(pool: &PgPool, job: &Job) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO face_jobs (id, state, origin_filename, processed_filename,
                               is_face_detected, coordinates, created_at, modified_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(job.id)
    .bind(job.state.to_string())
    .bind(&job.origin_filename)
    .bind(&job.processed_filename)
    .bind(job.is_face_detected)
    .bind(Json(&job.coordinates))
    .bind(job.created_at)
    .bind(job.modified_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, state, origin_filename, processed_filename, is_face_detected,
               coordinates, created_at, modified_at
        FROM face_jobs
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| job_from_row(&r)).transpose()
}

/// Overwrite every mutable column of a job. Returns the number of rows hit.
pub async fn update_job(pool: &PgPool, job: &Job) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE face_jobs
        SET state = $2,
            processed_filename = $3,
            is_face_detected = $4,
            coordinates = $5,
            modified_at = $6
        WHERE id = $1
        "#,
    )
    .bind(job.id)
    .bind(job.state.to_string())
    .bind(&job.processed_filename)
    .bind(job.is_face_detected)
    .bind(Json(&job.coordinates))
    .bind(job.modified_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

fn job_from_row(r: &PgRow) -> Result<Job, sqlx::Error> {
    let state_str: String = r.try_get("state")?;
    let state = state_str
        .parse::<JobState>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    let coordinates: Option<Json<Vec<BoundingBox>>> = r.try_get("coordinates")?;

    Ok(Job {
        id: r.try_get("id")?,
        state,
        origin_filename: r.try_get("origin_filename")?,
        processed_filename: r.try_get("processed_filename")?,
        is_face_detected: r.try_get("is_face_detected")?,
        coordinates: coordinates.map(|Json(c)| c).unwrap_or_default(),
        created_at: r.try_get("created_at")?,
        modified_at: r.try_get("modified_at")?,
    })
}
