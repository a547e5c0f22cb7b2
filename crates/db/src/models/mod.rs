//! Row models.
//!
//! Each submodule contains a `FromRow` struct matching the database row and
//! the conversion to and from the domain type in `kneepipe_core`.

pub mod job;
pub mod status;
