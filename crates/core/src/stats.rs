//! Usage statistics helpers.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Length of the hex prefix used as the stored email key.
const EMAIL_KEY_LEN: usize = 16;

/// Trim and lowercase an email so duplicates collapse. Blank input yields `None`.
pub fn normalize_email(email: &str) -> Option<String> {
    let normalized = email.trim().to_lowercase();
    (!normalized.is_empty()).then_some(normalized)
}

/// Storage key for a normalised email: the first 16 hex chars of its SHA-256.
pub fn email_key(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    let mut key: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    key.truncate(EMAIL_KEY_LEN);
    key
}

/// Aggregate numbers returned by the stats endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_jobs_processed: u64,
    pub total_jobs_today: u64,
    pub unique_users: u64,
    pub average_processing_time_seconds: f64,
    pub jobs_in_queue: u64,
    pub uptime_hours: f64,
}

/// Hours between `startup` and `now`, rounded to one decimal place.
pub fn uptime_hours(startup: crate::types::Timestamp, now: crate::types::Timestamp) -> f64 {
    let secs = (now - startup).num_seconds().max(0) as f64;
    (secs / 3600.0 * 10.0).round() / 10.0
}
