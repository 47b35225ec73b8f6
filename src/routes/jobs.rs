use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use crate::models::api::{CreateJobResponse, JobDetailResponse, ReasonResponse};
use crate::routes::ApiState;
use crate::services::jobs::ServiceError;
use crate::services::storage;

const UPLOAD_FIELD: &str = "file";

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) | ServiceError::FileNotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::NotFinished(_) => StatusCode::ACCEPTED,
            ServiceError::Failed(_) => StatusCode::CONFLICT,
            ServiceError::Producer(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::MissingArtifact(_)
            | ServiceError::Storage(_)
            | ServiceError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = ReasonResponse {
            reason: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// POST /image: upload an image and create a detection job.
pub async fn create_job(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<CreateJobResponse>), ServiceError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::Validation(e.body_text()))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| ServiceError::Validation(e.body_text()))?;

        let job = state.jobs.create_job(&data, content_type.as_deref()).await?;
        return Ok((StatusCode::CREATED, Json(CreateJobResponse::from(&job))));
    }

    Err(ServiceError::Validation(format!(
        "missing multipart field '{}'",
        UPLOAD_FIELD
    )))
}

/// GET /jobs/{job_id}: job state and detection results.
pub async fn get_job(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobDetailResponse>, ServiceError> {
    let job = state.jobs.get_job(job_id).await?;
    Ok(Json(job.into()))
}

/// GET /jobs/{job_id}/processed-image: annotated image of a finished job.
pub async fn processed_image(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let bytes = state.jobs.processed_image(job_id).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes))
}

/// GET <static_root>/{filename}: processed image as linked from notifications.
pub async fn static_image(
    State(state): State<ApiState>,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let bytes = state.jobs.static_image(&filename).await?;
    Ok(([(header::CONTENT_TYPE, storage::content_type(&filename))], bytes))
}
