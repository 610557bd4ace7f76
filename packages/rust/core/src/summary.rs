//! Run summary counters and the critical coverage check.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use sourcewatch_shared::{
    CoverageFailure, RunItem, RunOutput, RunSummary, SourceReport, SourceStatus,
};

/// Returns a failure when fewer than `ceil(ratio × eligible)` eligible sources
/// succeeded. A run with nothing eligible is never critical.
pub fn coverage_check(successful: usize, eligible: usize, min_success_ratio: f64) -> Option<CoverageFailure> {
    if eligible == 0 {
        return None;
    }
    let ratio = if min_success_ratio.is_finite() {
        min_success_ratio.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let required = (ratio * eligible as f64).ceil() as usize;
    (successful < required).then(|| CoverageFailure {
        successful,
        eligible,
        required,
        min_success_ratio: ratio,
    })
}

/// Count the per-source reports into a summary.
pub fn summarize(reports: &[SourceReport], new_items_count: usize) -> RunSummary {
    RunSummary {
        sources_checked: reports.len(),
        sources_successful: reports.iter().filter(|r| r.status.is_success()).count(),
        sources_with_items: reports.iter().filter(|r| r.item_count > 0).count(),
        new_items_count,
        items_fetched_count: reports.iter().map(|r| r.item_count).sum(),
        sources_skipped_cooldown: reports
            .iter()
            .filter(|r| r.status == SourceStatus::SkippedCooldown)
            .count(),
        retry_attempted_sources: reports.iter().filter(|r| r.retry_attempted).count(),
        retry_recovered_sources: reports.iter().filter(|r| r.retry_succeeded).count(),
    }
}

/// Assemble the run output. The critical flag never suppresses items.
pub fn build_output(
    run_id: Uuid,
    started_at: DateTime<Utc>,
    reports: Vec<SourceReport>,
    items: Vec<RunItem>,
    min_success_ratio: f64,
) -> RunOutput {
    let summary = summarize(&reports, items.len());
    let eligible = summary.sources_checked - summary.sources_skipped_cooldown;
    let critical = coverage_check(summary.sources_successful, eligible, min_success_ratio);

    RunOutput {
        run_id,
        started_at,
        generated_at: Utc::now(),
        summary,
        critical,
        items,
        sources: reports,
        store_errors: Vec::new(),
    }
}
