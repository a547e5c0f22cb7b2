//! Wait-time arithmetic for queued jobs.
//!
//! Pure functions only; the rolling duration history itself lives behind
//! the storage layer so that API and worker processes share it.

/// Average processing time assumed before any job has completed.
pub const DEFAULT_AVERAGE_SECS: f64 = 240.0;

/// Number of recent durations kept for the rolling average.
pub const HISTORY_LIMIT: usize = 20;

/// Mean of the recorded durations, or [`DEFAULT_AVERAGE_SECS`] when empty.
///
/// Only the first [`HISTORY_LIMIT`] entries are considered; callers pass the
/// history newest first.
pub fn average_duration(recent: &[f64]) -> f64 {
    let window = &recent[..recent.len().min(HISTORY_LIMIT)];
    if window.is_empty() {
        return DEFAULT_AVERAGE_SECS;
    }
    window.iter().sum::<f64>() / window.len() as f64
}

/// Estimated seconds until a job at `position` (1-based) finishes.
///
/// Position 0 means the job is not queued and yields 0.
pub fn estimate_wait(position: u64, average_secs: f64) -> u64 {
    if position == 0 || average_secs <= 0.0 {
        return 0;
    }
    (position as f64 * average_secs) as u64
}

/// Rough seconds left for a running job, one minute per remaining step.
pub fn remaining_from_steps(current_step: u32, total_steps: u32) -> u64 {
    u64::from(total_steps.saturating_sub(current_step)) * 60
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
