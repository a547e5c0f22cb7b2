//! Row model for the `jobs` table.

use kneepipe_core::error_codes::ErrorCode;
use kneepipe_core::job::{Job, JobStatus};
use kneepipe_core::options::JobOptions;
use kneepipe_core::types::{JobId, Timestamp};
use sqlx::FromRow;

use super::status::{JobStatusId, StatusId};
use crate::error::StoreError;

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: JobId,
    pub input_filename: String,
    pub input_path: String,
    pub options: serde_json::Value,
    pub status_id: StatusId,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub progress_percent: i16,
    pub current_step: i32,
    pub total_steps: i32,
    pub step_name: Option<String>,
    pub result_path: Option<String>,
    pub result_size_bytes: Option<i64>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub retain_for_research: bool,
    pub email: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status: JobStatus = JobStatusId::from_id(row.status_id)
            .ok_or_else(|| {
                StoreError::Corrupt(format!("job {}: unknown status_id {}", row.id, row.status_id))
            })?
            .into();
        let options: JobOptions = serde_json::from_value(row.options)?;
        let error_code = match row.error_code {
            Some(code) => Some(ErrorCode::parse(&code).ok_or_else(|| {
                StoreError::Corrupt(format!("job {}: unknown error_code {code}", row.id))
            })?),
            None => None,
        };

        Ok(Job {
            id: row.id,
            input_filename: row.input_filename,
            input_path: row.input_path,
            options,
            status,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            progress_percent: row.progress_percent.clamp(0, 100) as u8,
            current_step: row.current_step.max(0) as u32,
            total_steps: row.total_steps.max(0) as u32,
            step_name: row.step_name,
            result_path: row.result_path,
            result_size_bytes: row.result_size_bytes.map(|b| b.max(0) as u64),
            error_message: row.error_message,
            error_code,
            retain_for_research: row.retain_for_research,
            email: row.email,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn row() -> JobRow {
        JobRow {
            id: Uuid::new_v4(),
            input_filename: "knee.nii.gz".into(),
            input_path: "/data/uploads/knee.nii.gz".into(),
            options: serde_json::to_value(JobOptions::default()).unwrap(),
            status_id: JobStatusId::Error.id(),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: Some(Utc::now()),
            progress_percent: 40,
            current_step: 4,
            total_steps: 10,
            step_name: Some("Postprocessing".into()),
            result_path: None,
            result_size_bytes: None,
            error_message: Some("boom".into()),
            error_code: Some("GPU_OOM".into()),
            retain_for_research: false,
            email: None,
        }
    }

    #[test]
    fn converts_row_into_domain_job() {
        let job = Job::try_from(row()).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_code, Some(ErrorCode::GpuOom));
        assert_eq!(job.progress_percent, 40);
        assert_eq!(job.options, JobOptions::default());
    }

    #[test]
    fn unknown_codes_are_corrupt() {
        let bad_status = JobRow {
            status_id: 42,
            ..row()
        };
        assert_matches!(Job::try_from(bad_status), Err(StoreError::Corrupt(_)));

        let bad_code = JobRow {
            error_code: Some("MYSTERY".into()),
            ..row()
        };
        assert_matches!(Job::try_from(bad_code), Err(StoreError::Corrupt(_)));
    }
}
