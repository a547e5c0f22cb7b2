//! Handler for image uploads.
//!
//! The upload is streamed to `<UPLOAD_DIR>/<job_id>/<filename>`, validated
//! (zip archives are extracted into `<TEMP_DIR>/<job_id>`), and only then
//! turned into a queued job. Anything rejected along the way leaves nothing
//! behind on disk and never becomes a job record.

use std::path::{Path, PathBuf};

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use kneepipe_core::job::NewJob;
use kneepipe_core::options::{JobOptions, DEFAULT_CARTILAGE_SMOOTHING};
use kneepipe_core::types::JobId;
use kneepipe_core::upload::{detect_extension, prepare_upload, UploadError, ALLOWED_EXTENSIONS};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Response body for an accepted upload.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub job_id: JobId,
    pub status: &'static str,
    pub queue_position: u64,
    pub estimated_wait_seconds: u64,
    pub message: String,
}

/// Form fields other than the file, as sent.
#[derive(Debug, Default)]
struct UploadForm {
    email: Option<String>,
    segmentation_model: Option<String>,
    perform_nsm: Option<String>,
    nsm_type: Option<String>,
    retain_results: Option<String>,
    cartilage_smoothing: Option<String>,
    batch_size: Option<String>,
}

impl UploadForm {
    fn set(&mut self, name: &str, value: String) {
        let value = Some(value.trim().to_string()).filter(|v| !v.is_empty());
        match name {
            "email" => self.email = value,
            "segmentation_model" => self.segmentation_model = value,
            "perform_nsm" => self.perform_nsm = value,
            "nsm_type" => self.nsm_type = value,
            "retain_results" => self.retain_results = value,
            "cartilage_smoothing" => self.cartilage_smoothing = value,
            "batch_size" => self.batch_size = value,
            other => tracing::debug!(field = other, "Ignoring unknown upload field"),
        }
    }

    /// Parse and range-check the processing options.
    fn options(&self) -> AppResult<JobOptions> {
        let mut options = JobOptions::default();
        if let Some(model) = &self.segmentation_model {
            options.segmentation_model = model.parse()?;
        }
        if let Some(nsm_type) = &self.nsm_type {
            options.nsm_type = nsm_type.parse()?;
        }
        options.perform_nsm = parse_flag("perform_nsm", self.perform_nsm.as_deref(), true)?;
        options.cartilage_smoothing = match &self.cartilage_smoothing {
            Some(raw) => raw.parse().map_err(|_| {
                AppError::BadRequest(format!("cartilage_smoothing must be a number, got '{raw}'"))
            })?,
            None => DEFAULT_CARTILAGE_SMOOTHING,
        };
        options.batch_size = match &self.batch_size {
            Some(raw) => Some(raw.parse().map_err(|_| {
                AppError::BadRequest(format!("batch_size must be a positive integer, got '{raw}'"))
            })?),
            None => None,
        };
        Ok(options.validated()?)
    }

    fn retain_results(&self) -> AppResult<bool> {
        parse_flag("retain_results", self.retain_results.as_deref(), true)
    }
}

/// Form booleans as browsers and curl send them.
fn parse_flag(name: &str, raw: Option<&str>, default: bool) -> AppResult<bool> {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("true" | "1" | "yes" | "on") => Ok(true),
        Some("false" | "0" | "no" | "off") => Ok(false),
        Some(other) => Err(AppError::BadRequest(format!(
            "{name} must be true or false, got '{other}'"
        ))),
    }
}

/// An uploaded file written to disk.
struct SavedFile {
    filename: String,
    path: PathBuf,
}

/// POST /api/v1/upload
///
/// Multipart fields: `file` (required), `email`, `segmentation_model`,
/// `perform_nsm`, `nsm_type`, `retain_results`, `cartilage_smoothing`,
/// `batch_size`.
pub async fn upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<UploadResponse>)> {
    let job_id = Uuid::new_v4();
    let upload_dir = state.storage.upload_dir.join(job_id.to_string());
    let scratch_dir = state.storage.temp_dir.join(job_id.to_string());

    let result = accept(&state, job_id, &upload_dir, &scratch_dir, multipart).await;
    if let Err(e) = &result {
        tracing::info!(job_id = %job_id, error = %e, "Upload rejected");
        remove_dir_quietly(&upload_dir).await;
        remove_dir_quietly(&scratch_dir).await;
    }
    result
}

async fn accept(
    state: &AppState,
    job_id: JobId,
    upload_dir: &Path,
    scratch_dir: &Path,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<UploadResponse>)> {
    let max_bytes = state.storage.max_upload_bytes();
    let mut form = UploadForm::default();
    let mut saved = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            saved = Some(save_file(field, upload_dir, max_bytes).await?);
        } else {
            let value = field.text().await.map_err(multipart_error)?;
            form.set(&name, value);
        }
    }

    let saved = saved.ok_or_else(|| AppError::BadRequest("No file uploaded".into()))?;
    let options = form.options()?;
    let retain_for_research = form.retain_results()?;

    let upload_path = saved.path.clone();
    let scratch = scratch_dir.to_path_buf();
    let prepared = tokio::task::spawn_blocking(move || prepare_upload(&upload_path, &scratch))
        .await
        .map_err(|e| AppError::InternalError(format!("Upload validation task failed: {e}")))??;

    let submission = state
        .orchestrator
        .submit(NewJob {
            id: job_id,
            input_filename: saved.filename,
            input_path: prepared.display().to_string(),
            options,
            retain_for_research,
            email: form.email,
        })
        .await?;

    let queue_position = submission.queue_position;
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            job_id,
            status: "queued",
            queue_position,
            estimated_wait_seconds: submission.estimated_wait_seconds,
            message: format!("File uploaded successfully. You are #{queue_position} in queue."),
        }),
    ))
}

/// Stream the file field to disk, enforcing the size limit as bytes arrive.
async fn save_file(mut field: Field<'_>, dir: &Path, max_bytes: u64) -> AppResult<SavedFile> {
    let filename = field
        .file_name()
        .map(base_name)
        .filter(|n| !n.is_empty())
        .unwrap_or("unknown")
        .to_string();

    if detect_extension(&filename).is_none() {
        let suffix = filename
            .rfind('.')
            .map(|i| filename[i..].to_ascii_lowercase())
            .unwrap_or_default();
        return Err(AppError::BadRequest(format!(
            "Invalid file type '{suffix}'. Accepted: {}",
            ALLOWED_EXTENSIONS.join(", ")
        )));
    }

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(UploadError::from)?;
    let path = dir.join(&filename);
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(UploadError::from)?;

    let mut written: u64 = 0;
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(too_large(max_bytes));
        }
        file.write_all(&chunk).await.map_err(UploadError::from)?;
    }
    file.flush().await.map_err(UploadError::from)?;

    if written == 0 {
        return Err(UploadError::Empty.into());
    }

    tracing::debug!(filename = %filename, bytes = written, "Upload saved");
    Ok(SavedFile { filename, path })
}

/// Last path component of a client-supplied file name.
fn base_name(name: &str) -> &str {
    name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(name)
}

fn too_large(max_bytes: u64) -> AppError {
    AppError::PayloadTooLarge(format!(
        "File too large. Maximum: {} MB.",
        max_bytes / (1024 * 1024)
    ))
}

fn multipart_error(err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(err.body_text())
    } else {
        AppError::BadRequest(err.body_text())
    }
}

async fn remove_dir_quietly(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to clean up upload");
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use kneepipe_core::options::{NsmType, SegmentationModel};

    use super::*;

    #[test]
    fn defaults_apply_when_fields_are_absent() {
        let form = UploadForm::default();
        assert_eq!(form.options().unwrap(), JobOptions::default());
        assert!(form.retain_results().unwrap());
    }

    #[test]
    fn form_fields_are_parsed() {
        let mut form = UploadForm::default();
        form.set("segmentation_model", "goyal_axial".into());
        form.set("nsm_type", "both".into());
        form.set("perform_nsm", "false".into());
        form.set("cartilage_smoothing", "0.5".into());
        form.set("batch_size", "16".into());
        form.set("retain_results", "0".into());

        let options = form.options().unwrap();
        assert_eq!(options.segmentation_model, SegmentationModel::GoyalAxial);
        assert_eq!(options.nsm_type, NsmType::Both);
        assert!(!options.perform_nsm);
        assert_eq!(options.cartilage_smoothing, 0.5);
        assert_eq!(options.batch_size, Some(16));
        assert!(!form.retain_results().unwrap());
    }

    #[test]
    fn out_of_range_smoothing_is_rejected() {
        let mut form = UploadForm::default();
        form.set("cartilage_smoothing", "5".into());
        assert_matches!(form.options(), Err(AppError::Core(_)));
    }

    #[test]
    fn unknown_model_is_rejected() {
        let mut form = UploadForm::default();
        form.set("segmentation_model", "unet9000".into());
        assert_matches!(form.options(), Err(AppError::Core(_)));
    }

    #[test]
    fn garbage_flag_is_rejected() {
        assert_matches!(
            parse_flag("perform_nsm", Some("maybe"), true),
            Err(AppError::BadRequest(_))
        );
        assert!(parse_flag("perform_nsm", Some("ON"), false).unwrap());
    }

    #[test]
    fn blank_email_is_dropped() {
        let mut form = UploadForm::default();
        form.set("email", "   ".into());
        assert!(form.email.is_none());
    }

    #[test]
    fn client_paths_are_stripped() {
        assert_eq!(base_name("../../etc/knee.nii"), "knee.nii");
        assert_eq!(base_name("C:\\scans\\knee.zip"), "knee.zip");
        assert_eq!(base_name("knee.nrrd"), "knee.nrrd");
    }
}
