//! Statistics reporting for the store and for individual runs
//!
//! This module provides functionality for extracting store statistics from
//! the storage layer and displaying them, along with end-of-run reports.

use crate::crawler::CrawlReport;
use crate::state::StatsSnapshot;
use crate::storage::{RunRecord, Storage};
use crate::HarvestError;
use std::fmt::Write;

/// Store statistics summary
#[derive(Debug, Clone)]
pub struct StoreStatistics {
    /// Total number of distinct records
    pub total_records: u64,

    /// Record counts per category, largest first
    pub by_category: Vec<(String, u64)>,

    /// Most recent crawl run, if any
    pub latest_run: Option<RunRecord>,
}

/// Loads statistics from storage
///
/// # Arguments
///
/// * `storage` - The storage backend to query
///
/// # Returns
///
/// * `Ok(StoreStatistics)` - Successfully loaded statistics
/// * `Err(HarvestError)` - Failed to query statistics
pub fn load_statistics(storage: &dyn Storage) -> Result<StoreStatistics, HarvestError> {
    Ok(StoreStatistics {
        total_records: storage.count_records()?,
        by_category: storage.count_by_category()?,
        latest_run: storage.get_latest_run()?,
    })
}

/// Wall-clock length of a finished run, in seconds
fn run_duration_seconds(run: &RunRecord) -> Option<i64> {
    let started = run.started_at.parse::<chrono::DateTime<chrono::Utc>>().ok()?;
    let finished = run
        .finished_at
        .as_ref()?
        .parse::<chrono::DateTime<chrono::Utc>>()
        .ok()?;
    Some((finished - started).num_seconds())
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole > 0 {
        (part as f64 / whole as f64) * 100.0
    } else {
        0.0
    }
}

fn render_counters(out: &mut String, stats: &StatsSnapshot) {
    let _ = writeln!(out, "Records:");
    let _ = writeln!(out, "  Observed: {}", stats.records_observed);
    let _ = writeln!(out, "  Inserted: {}", stats.inserted);
    let _ = writeln!(out, "  Updated: {}", stats.updated);
    let _ = writeln!(out, "  Skipped (no key): {}", stats.skipped);
    let _ = writeln!(out);

    let _ = writeln!(out, "Partitions:");
    let _ = writeln!(out, "  Probed: {}", stats.partitions_probed);
    let _ = writeln!(out, "  Subdivided: {}", stats.partitions_subdivided);
    let _ = writeln!(out, "  Capped: {}", stats.partitions_capped);
    let _ = writeln!(out, "  Probe failures: {}", stats.probe_failures);
    let _ = writeln!(out);

    let _ = writeln!(out, "Leaves:");
    let _ = writeln!(out, "  Crawled: {}", stats.leaves_crawled);
    let _ = writeln!(out, "  Failed: {}", stats.leaves_failed);
    let _ = writeln!(out, "  Truncated (page cap): {}", stats.leaves_truncated);
    let _ = writeln!(out, "  Skipped (already done): {}", stats.leaves_skipped);
    let _ = writeln!(out);

    let _ = writeln!(out, "Fetching:");
    let _ = writeln!(out, "  Errors: {}", stats.fetch_errors);
    let _ = writeln!(out, "  Retries: {}", stats.fetch_retries);
}

/// Formats store statistics for display
pub fn render_statistics(stats: &StoreStatistics) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Store Statistics ===\n");
    let _ = writeln!(out, "Total records: {}", stats.total_records);
    let _ = writeln!(out);

    if !stats.by_category.is_empty() {
        let _ = writeln!(out, "Records by Category:");
        for (category, count) in &stats.by_category {
            let _ = writeln!(
                out,
                "  {}: {} ({:.1}%)",
                category,
                count,
                percentage(*count, stats.total_records)
            );
        }
        let _ = writeln!(out);
    }

    match &stats.latest_run {
        Some(run) => {
            let _ = writeln!(out, "Latest Run:");
            let _ = writeln!(out, "  ID: {}", run.id);
            let _ = writeln!(out, "  Status: {}", run.status.to_db_string());
            let _ = writeln!(out, "  Started: {}", run.started_at);
            if let Some(finished) = &run.finished_at {
                let _ = writeln!(out, "  Finished: {}", finished);
            }
            if let Some(seconds) = run_duration_seconds(run) {
                let _ = writeln!(out, "  Duration: {}s", seconds);
            }
            let _ = writeln!(out);
            if let Some(snapshot) = &run.stats {
                render_counters(&mut out, snapshot);
            }
        }
        None => {
            let _ = writeln!(out, "No crawl runs recorded");
        }
    }

    out
}

/// Formats the outcome of a crawl for display
pub fn render_crawl_report(report: &CrawlReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Crawl Report ===\n");
    let _ = writeln!(out, "Run {}: {}", report.run_id, report.status.to_db_string());
    let _ = writeln!(out, "Duration: {:.1}s", report.duration.as_secs_f64());
    let _ = writeln!(out);
    render_counters(&mut out, &report.stats);

    if report.stats.partitions_capped > 0 {
        let _ = writeln!(
            out,
            "\n{} partition(s) were too dense to split further; only their first result window was retrieved.",
            report.stats.partitions_capped
        );
    }
    if report.stats.leaves_failed > 0 {
        let _ = writeln!(
            out,
            "\n{} leaf partition(s) failed; re-run to retry them.",
            report.stats.leaves_failed
        );
    }
    if report.stats.leaves_truncated > 0 {
        let _ = writeln!(
            out,
            "\n{} leaf partition(s) hit the page cap before their reported total; raise max-pages or re-run.",
            report.stats.leaves_truncated
        );
    }

    out
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &StoreStatistics) {
    print!("{}", render_statistics(stats));
}

pub fn print_crawl_report(report: &CrawlReport) {
    print!("{}", render_crawl_report(report));
}
