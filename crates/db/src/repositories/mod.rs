//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument. [`SlotRepo`] is the exception:
//! advisory locks are per session, so it works on one connection.

pub mod duration_repo;
pub mod job_repo;
pub mod queue_repo;
pub mod slot_repo;
pub mod stats_repo;

pub use duration_repo::DurationRepo;
pub use job_repo::JobRepo;
pub use queue_repo::QueueRepo;
pub use slot_repo::SlotRepo;
pub use stats_repo::StatsRepo;
