//! Repository for usage counters, submitter keys and service metadata.

use chrono::NaiveDate;
use kneepipe_core::types::Timestamp;
use sqlx::PgPool;

/// Key of the all-time processed counter.
const TOTAL_KEY: &str = "total_processed";

/// Key of the lazily recorded startup timestamp.
const STARTUP_KEY: &str = "startup_time";

/// Counter key for jobs processed on `day`.
pub fn daily_key(day: NaiveDate) -> String {
    format!("daily:{}", day.format("%Y-%m-%d"))
}

/// Provides statistics persistence.
pub struct StatsRepo;

impl StatsRepo {
    /// Bump the total and daily counters in one statement.
    pub async fn increment_processed(pool: &PgPool, day: NaiveDate) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO stats_counters (key, value) VALUES ($1, 1), ($2, 1) \
             ON CONFLICT (key) DO UPDATE SET value = stats_counters.value + 1",
        )
        .bind(TOTAL_KEY)
        .bind(daily_key(day))
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn counter(pool: &PgPool, key: &str) -> Result<i64, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT value FROM stats_counters WHERE key = $1")
            .bind(key)
            .fetch_optional(pool)
            .await?;
        Ok(row.map_or(0, |(v,)| v))
    }

    pub async fn total(pool: &PgPool) -> Result<i64, sqlx::Error> {
        Self::counter(pool, TOTAL_KEY).await
    }

    pub async fn on_day(pool: &PgPool, day: NaiveDate) -> Result<i64, sqlx::Error> {
        Self::counter(pool, &daily_key(day)).await
    }

    pub async fn track_email(pool: &PgPool, email_key: &str) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO user_emails (email_key) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(email_key)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn unique_emails(pool: &PgPool) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM user_emails")
            .fetch_one(pool)
            .await?;
        Ok(count)
    }

    /// Record the startup time if absent, then return the stored value.
    pub async fn startup_time(pool: &PgPool) -> Result<Timestamp, sqlx::Error> {
        sqlx::query(
            "INSERT INTO service_metadata (key, value) VALUES ($1, NOW()) \
             ON CONFLICT (key) DO NOTHING",
        )
        .bind(STARTUP_KEY)
        .execute(pool)
        .await?;
        let (value,): (Timestamp,) =
            sqlx::query_as("SELECT value FROM service_metadata WHERE key = $1")
                .bind(STARTUP_KEY)
                .fetch_one(pool)
                .await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_key_uses_iso_date() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
        assert_eq!(daily_key(day), "daily:2025-03-07");
    }
}
