//! Domain logic for the knee MRI processing backend.
//!
//! Everything in this crate is storage-agnostic: the job record and its
//! state machine, the progress translator, the error classifier, wait-time
//! math, upload preparation, and the subprocess plumbing used to drive the
//! external segmentation pipeline.

pub mod error;
pub mod error_codes;
pub mod estimation;
pub mod job;
pub mod options;
pub mod pipeline;
pub mod progress;
pub mod stats;
pub mod types;
pub mod upload;
