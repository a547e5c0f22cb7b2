//! Status helper enum mapping to the `job_statuses` lookup table.
//!
//! Each variant's discriminant matches the seed data order (1-based) in the
//! migration that creates the table.

use kneepipe_core::job::JobStatus;

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

/// Database representation of [`JobStatus`].
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatusId {
    Queued = 1,
    Processing = 2,
    Complete = 3,
    Error = 4,
}

impl JobStatusId {
    /// Return the database status ID.
    pub fn id(self) -> StatusId {
        self as StatusId
    }

    pub fn from_id(id: StatusId) -> Option<Self> {
        match id {
            1 => Some(Self::Queued),
            2 => Some(Self::Processing),
            3 => Some(Self::Complete),
            4 => Some(Self::Error),
            _ => None,
        }
    }
}

impl From<JobStatus> for JobStatusId {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Queued => Self::Queued,
            JobStatus::Processing => Self::Processing,
            JobStatus::Complete => Self::Complete,
            JobStatus::Error => Self::Error,
        }
    }
}

impl From<JobStatusId> for JobStatus {
    fn from(id: JobStatusId) -> Self {
        match id {
            JobStatusId::Queued => Self::Queued,
            JobStatusId::Processing => Self::Processing,
            JobStatusId::Complete => Self::Complete,
            JobStatusId::Error => Self::Error,
        }
    }
}
