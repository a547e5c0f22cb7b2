//! Persistence for jobs, the queue index, duration history and statistics.
//!
//! Callers work against the traits in [`store`]; [`Stores`] bundles one
//! implementation per concern. Two backends exist: [`memory::MemoryStore`]
//! and [`postgres::PgStore`].

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod repositories;
pub mod store;
pub mod wait;

use sqlx::postgres::PgPoolOptions;

pub use error::StoreError;
pub use store::{
    DurationHistory, JobStore, ProcessingSlot, QueueIndex, SlotLease, StatsStore, Stores,
};
pub use wait::WaitEstimator;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to confirm the database is reachable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply the embedded migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
