//! Progress translation from pipeline output.
//!
//! The pipeline prints free-form log text. [`parse_progress_line`] turns a
//! single line into a structured [`ProgressUpdate`] when it recognises one,
//! and [`estimate_from_time`] provides the fallback used while the pipeline
//! has not said anything recognisable yet.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Number of steps in the full pipeline.
pub const TOTAL_STEPS: u32 = 10;

/// Expected pipeline duration used by the time-based fallback.
pub const DEFAULT_EXPECTED_SECS: f64 = 300.0;

/// Ceiling for time-based estimates; only a real exit may report completion.
pub const TIME_ESTIMATE_CAP_PERCENT: u8 = 95;

/// Step name reported for bare percentage markers.
const GENERIC_STEP_NAME: &str = "Processing...";

/// A structured progress reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub step: u32,
    pub total_steps: u32,
    pub step_name: String,
    pub percent: u8,
}

impl ProgressUpdate {
    fn from_step(step: u32, total_steps: u32, step_name: impl Into<String>) -> Self {
        Self {
            step,
            total_steps,
            step_name: step_name.into(),
            percent: percent_of(step, total_steps),
        }
    }
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

/// `[PROGRESS] 5/10: Computing thickness`
static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[PROGRESS\]\s*(\d+)\s*/\s*(\d+)\s*:\s*(.+)").expect("valid regex")
});

/// `Processing... 45%`, `[45%]`, `(45%)`
static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})%").expect("valid regex"));

/// Known pipeline phrases in pipeline order, each pinned to a step.
static STEP_PATTERNS: LazyLock<Vec<(Regex, u32, &'static str)>> = LazyLock::new(|| {
    [
        (r"loading.*model", 1, "Loading segmentation model"),
        (r"preprocessing", 2, "Preprocessing image"),
        (r"running.*segmentation", 3, "Running segmentation"),
        (r"postprocessing", 4, "Postprocessing results"),
        (r"generating.*mesh", 5, "Generating 3D meshes"),
        (r"calculating.*thickness", 6, "Calculating cartilage thickness"),
        (r"running.*nsm|neural shape model", 7, "Running Neural Shape Model"),
        (r"computing.*b?score", 8, "Computing BScore"),
        (r"saving.*results", 9, "Saving results"),
        (r"\b(complete|finished|done)\b", 10, "Complete"),
    ]
    .into_iter()
    .map(|(pattern, step, name)| {
        let re = Regex::new(&format!("(?i){pattern}")).expect("valid regex");
        (re, step, name)
    })
    .collect()
});

/// Step names used by the time-based estimate.
const TIME_STEP_NAMES: [&str; TOTAL_STEPS as usize] = [
    "Loading model",
    "Preprocessing",
    "Running segmentation",
    "Postprocessing",
    "Generating meshes",
    "Calculating thickness",
    "Running NSM",
    "Computing BScore",
    "Saving results",
    "Complete",
];

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse one line of pipeline output.
///
/// Matching order, first hit wins:
/// 1. explicit `[PROGRESS] step/total: name` marker
/// 2. bare `NN%` percentage
/// 3. known pipeline phrases
///
/// Returns `None` when the line carries no progress information.
pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    parse_marker(line)
        .or_else(|| parse_percent(line))
        .or_else(|| parse_phrase(line))
}

fn parse_marker(line: &str) -> Option<ProgressUpdate> {
    let caps = MARKER_RE.captures(line)?;
    let step: u32 = caps[1].parse().ok()?;
    let total: u32 = caps[2].parse().ok()?;
    if total == 0 {
        return None;
    }
    let name = caps[3].trim();
    Some(ProgressUpdate::from_step(step.min(total), total, name))
}

fn parse_percent(line: &str) -> Option<ProgressUpdate> {
    let caps = PERCENT_RE.captures(line)?;
    let raw: u32 = caps[1].parse().ok()?;
    let percent = raw.min(100) as u8;
    Some(ProgressUpdate {
        step: step_for_percent(percent, |x| x.round()),
        total_steps: TOTAL_STEPS,
        step_name: GENERIC_STEP_NAME.to_string(),
        percent,
    })
}

fn parse_phrase(line: &str) -> Option<ProgressUpdate> {
    STEP_PATTERNS
        .iter()
        .find(|(re, _, _)| re.is_match(line))
        .map(|(_, step, name)| ProgressUpdate::from_step(*step, TOTAL_STEPS, *name))
}

// ---------------------------------------------------------------------------
// Time-based fallback
// ---------------------------------------------------------------------------

/// Estimate progress from elapsed time when the pipeline is silent.
///
/// A non-positive `expected_total_secs` falls back to
/// [`DEFAULT_EXPECTED_SECS`]. The percentage never exceeds
/// [`TIME_ESTIMATE_CAP_PERCENT`].
pub fn estimate_from_time(elapsed_secs: f64, expected_total_secs: f64) -> ProgressUpdate {
    let expected = if expected_total_secs > 0.0 {
        expected_total_secs
    } else {
        DEFAULT_EXPECTED_SECS
    };
    let raw = (elapsed_secs.max(0.0) / expected * 100.0) as u32;
    let percent = raw.min(TIME_ESTIMATE_CAP_PERCENT as u32) as u8;
    let step = step_for_percent(percent, f64::trunc);

    ProgressUpdate {
        step,
        total_steps: TOTAL_STEPS,
        step_name: TIME_STEP_NAMES[(step - 1) as usize].to_string(),
        percent,
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `round(100 * step / total)`, clamped to 100.
fn percent_of(step: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (100.0 * step as f64 / total as f64).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Map a percentage onto `1..=TOTAL_STEPS`.
fn step_for_percent(percent: u8, rounding: impl Fn(f64) -> f64) -> u32 {
    let step = rounding(percent as f64 / 100.0 * TOTAL_STEPS as f64) as u32;
    step.clamp(1, TOTAL_STEPS)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_marker_is_authoritative() {
        let update = parse_progress_line("[PROGRESS] 5/10: Computing thickness").unwrap();
        assert_eq!(update.step, 5);
        assert_eq!(update.total_steps, 10);
        assert_eq!(update.percent, 50);
        assert_eq!(update.step_name, "Computing thickness");
    }

    #[test]
    fn marker_wins_over_phrases_and_percent() {
        let update = parse_progress_line("[PROGRESS] 1/3: Saving results 80%").unwrap();
        assert_eq!(update.step, 1);
        assert_eq!(update.total_steps, 3);
        assert_eq!(update.percent, 33);
    }

    #[test]
    fn marker_step_is_clamped_to_total() {
        let update = parse_progress_line("[PROGRESS] 7/4: Overshoot").unwrap();
        assert_eq!(update.step, 4);
        assert_eq!(update.percent, 100);
    }

    #[test]
    fn marker_with_zero_total_is_ignored() {
        assert_eq!(parse_progress_line("[PROGRESS] 0/0: nothing"), None);
    }

    #[test]
    fn bare_percentage() {
        let update = parse_progress_line("Processing... 45%").unwrap();
        assert_eq!(update.percent, 45);
        assert_eq!(update.total_steps, TOTAL_STEPS);
        assert_eq!(update.step, 5);
        assert_eq!(update.step_name, "Processing...");
    }

    #[test]
    fn percentage_is_capped_and_step_floored_at_one() {
        assert_eq!(parse_progress_line("[250%]").unwrap().percent, 100);
        let low = parse_progress_line("(0%)").unwrap();
        assert_eq!(low.percent, 0);
        assert_eq!(low.step, 1);
    }

    #[test]
    fn known_phrases_map_to_fixed_steps() {
        let cases = [
            ("Loading nnU-Net model weights", 1),
            ("Preprocessing volume", 2),
            ("Running segmentation on femur", 3),
            ("Postprocessing masks", 4),
            ("Generating mesh for tibia", 5),
            ("Calculating thickness map", 6),
            ("Running NSM fit", 7),
            ("Fitting neural shape model", 7),
            ("Computing BScore", 8),
            ("Saving results to disk", 9),
            ("Pipeline finished", 10),
        ];
        for (line, step) in cases {
            let update = parse_progress_line(line).unwrap_or_else(|| panic!("no match: {line}"));
            assert_eq!(update.step, step, "line: {line}");
            assert_eq!(update.percent as u32, step * 10, "line: {line}");
        }
    }

    #[test]
    fn phrase_matching_is_case_insensitive() {
        assert_eq!(parse_progress_line("RUNNING SEGMENTATION").unwrap().step, 3);
    }

    #[test]
    fn unrecognised_lines_yield_nothing() {
        assert_eq!(
            parse_progress_line("2024-01-15 10:30:45 INFO worker heartbeat ok"),
            None
        );
        assert_eq!(parse_progress_line(""), None);
    }

    #[test]
    fn time_estimate_tracks_elapsed_fraction() {
        let update = estimate_from_time(150.0, 300.0);
        assert_eq!(update.percent, 50);
        assert_eq!(update.step, 5);
        assert_eq!(update.step_name, "Generating meshes");
    }

    #[test]
    fn time_estimate_is_capped() {
        let update = estimate_from_time(10_000.0, 300.0);
        assert_eq!(update.percent, TIME_ESTIMATE_CAP_PERCENT);
        assert_eq!(update.step, 9);
    }

    #[test]
    fn time_estimate_defaults_expected_total() {
        assert_eq!(estimate_from_time(30.0, 0.0).percent, 10);
        let start = estimate_from_time(0.0, -5.0);
        assert_eq!(start.percent, 0);
        assert_eq!(start.step, 1);
        assert_eq!(start.step_name, "Loading model");
    }
}
