//! Repository for the `jobs` table.

use kneepipe_core::job::Job;
use kneepipe_core::types::JobId;
use sqlx::PgPool;

use crate::error::StoreError;
use crate::models::job::JobRow;
use crate::models::status::JobStatusId;

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, input_filename, input_path, options, status_id, \
    created_at, started_at, completed_at, \
    progress_percent, current_step, total_steps, step_name, \
    result_path, result_size_bytes, error_message, error_code, \
    retain_for_research, email";

/// Provides persistence for job records.
pub struct JobRepo;

impl JobRepo {
    /// Insert a new job. Returns `false` if the id already exists.
    pub async fn insert(pool: &PgPool, job: &Job) -> Result<bool, StoreError> {
        let query = format!(
            "INSERT INTO jobs ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18) \
             ON CONFLICT (id) DO NOTHING"
        );
        let result = sqlx::query(&query)
            .bind(job.id)
            .bind(&job.input_filename)
            .bind(&job.input_path)
            .bind(serde_json::to_value(&job.options)?)
            .bind(JobStatusId::from(job.status).id())
            .bind(job.created_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(i16::from(job.progress_percent))
            .bind(job.current_step as i32)
            .bind(job.total_steps as i32)
            .bind(&job.step_name)
            .bind(&job.result_path)
            .bind(job.result_size_bytes.map(|b| b as i64))
            .bind(&job.error_message)
            .bind(job.error_code.map(|c| c.as_str()))
            .bind(job.retain_for_research)
            .bind(&job.email)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Find a job by id.
    pub async fn find_by_id(pool: &PgPool, id: JobId) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    /// Overwrite the mutable columns of a job. Returns `false` if no row matched.
    pub async fn update(pool: &PgPool, job: &Job) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET \
                 status_id = $2, started_at = $3, completed_at = $4, \
                 progress_percent = $5, current_step = $6, total_steps = $7, step_name = $8, \
                 result_path = $9, result_size_bytes = $10, \
                 error_message = $11, error_code = $12, \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(job.id)
        .bind(JobStatusId::from(job.status).id())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(i16::from(job.progress_percent))
        .bind(job.current_step as i32)
        .bind(job.total_steps as i32)
        .bind(&job.step_name)
        .bind(&job.result_path)
        .bind(job.result_size_bytes.map(|b| b as i64))
        .bind(&job.error_message)
        .bind(job.error_code.map(|c| c.as_str()))
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
