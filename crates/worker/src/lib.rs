//! Runs queued segmentation jobs through the external pipeline.

pub mod config;
pub mod orchestrator;
pub mod releaser;
pub mod worker;

pub use config::{ConfigError, PipelineConfig};
pub use orchestrator::{JobOrchestrator, Submission};
pub use releaser::{GpuReleaser, ResourceReleaser};
pub use worker::Worker;
