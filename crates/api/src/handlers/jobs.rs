//! Handlers for job status and result download.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use kneepipe_core::error_codes::ErrorCode;
use kneepipe_core::estimation::remaining_from_steps;
use kneepipe_core::job::{Job, JobStatus};
use kneepipe_core::pipeline::archive_name;
use kneepipe_core::types::JobId;
use kneepipe_core::upload::file_stem;
use serde::Serialize;
use tokio_util::io::ReaderStream;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Shown while a processing job has not reported a step yet.
const PENDING_STEP_NAME: &str = "Processing...";

/// Body of `GET /status/{id}`; the field set depends on the status.
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StatusResponse {
    Queued {
        job_id: JobId,
        queue_position: u64,
        estimated_wait_seconds: u64,
    },
    Processing {
        job_id: JobId,
        progress_percent: u8,
        current_step: u32,
        total_steps: u32,
        step_name: String,
        elapsed_seconds: u64,
        estimated_remaining_seconds: u64,
    },
    Complete {
        job_id: JobId,
        download_url: String,
        result_size_bytes: u64,
        processing_time_seconds: u64,
    },
    Error {
        job_id: JobId,
        error_message: String,
        error_code: ErrorCode,
    },
}

impl StatusResponse {
    /// Build the response for a non-queued job.
    ///
    /// Queued jobs need the queue, so they are handled by [`get_status`].
    fn for_started(job: &Job) -> Self {
        match job.status {
            JobStatus::Queued | JobStatus::Processing => Self::Processing {
                job_id: job.id,
                progress_percent: job.progress_percent,
                current_step: job.current_step,
                total_steps: job.total_steps,
                step_name: job
                    .step_name
                    .clone()
                    .unwrap_or_else(|| PENDING_STEP_NAME.to_string()),
                elapsed_seconds: job.elapsed_seconds(Utc::now()) as u64,
                estimated_remaining_seconds: remaining_from_steps(
                    job.current_step,
                    job.total_steps,
                ),
            },
            JobStatus::Complete => Self::Complete {
                job_id: job.id,
                download_url: download_url(job.id),
                result_size_bytes: job.result_size_bytes.unwrap_or(0),
                processing_time_seconds: job.processing_seconds().unwrap_or(0.0) as u64,
            },
            JobStatus::Error => Self::Error {
                job_id: job.id,
                error_message: job
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string()),
                error_code: job.error_code.unwrap_or(ErrorCode::PipelineError),
            },
        }
    }
}

pub fn download_url(id: JobId) -> String {
    format!("/api/v1/download/{id}")
}

/// GET /api/v1/status/{id}
pub async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> AppResult<Json<StatusResponse>> {
    let job = state.stores.jobs.get(id).await?;

    if job.status != JobStatus::Queued {
        return Ok(Json(StatusResponse::for_started(&job)));
    }

    let queue_position = state.stores.queue.rank(id).await?;
    let estimated_wait_seconds = state
        .stores
        .wait_estimator()
        .estimate_wait(queue_position)
        .await?;

    Ok(Json(StatusResponse::Queued {
        job_id: id,
        queue_position,
        estimated_wait_seconds,
    }))
}

/// GET /api/v1/download/{id}
///
/// Streams the results archive of a completed job.
pub async fn download(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.stores.jobs.get(id).await?;

    if job.status != JobStatus::Complete {
        return Err(AppError::BadRequest(format!(
            "Job not complete. Current status: {}",
            job.status
        )));
    }

    let path = job
        .result_path
        .as_deref()
        .ok_or_else(|| AppError::NotFound("Results not found".into()))?;
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound("Results file not found".into()));
        }
        Err(e) => return Err(AppError::InternalError(format!("Failed to open results: {e}"))),
    };
    let size = file
        .metadata()
        .await
        .map_err(|e| AppError::InternalError(format!("Failed to stat results: {e}")))?
        .len();

    let filename = archive_name(file_stem(&job.input_filename));
    tracing::info!(job_id = %id, filename = %filename, size, "Serving results");

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
            (header::CONTENT_LENGTH, size.to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    ))
}
