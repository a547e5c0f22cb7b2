//! Session advisory lock guarding the processing slot.
//!
//! The lock belongs to the database session, so these methods take the
//! connection that holds it rather than the pool.

use sqlx::PgConnection;

/// Advisory lock key for the processing slot.
pub const PROCESSING_SLOT_KEY: i64 = 0x6b6e_6565_7069_7065;

/// Provides the cross-process processing slot.
pub struct SlotRepo;

impl SlotRepo {
    /// `true` when this session now holds the slot.
    pub async fn try_lock(conn: &mut PgConnection) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(PROCESSING_SLOT_KEY)
            .fetch_one(conn)
            .await
    }

    /// `false` when this session did not hold the slot.
    pub async fn unlock(conn: &mut PgConnection) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(PROCESSING_SLOT_KEY)
            .fetch_one(conn)
            .await
    }
}
