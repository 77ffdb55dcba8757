use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for one crawl
///
/// Shared by reference between the coordinator, its workers and the fetch
/// layer; every mutation is a single atomic increment.
#[derive(Debug, Default)]
pub struct CrawlStats {
    records_observed: AtomicU64,
    inserted: AtomicU64,
    updated: AtomicU64,
    skipped: AtomicU64,
    fetch_errors: AtomicU64,
    fetch_retries: AtomicU64,
    partitions_probed: AtomicU64,
    partitions_subdivided: AtomicU64,
    partitions_capped: AtomicU64,
    probe_failures: AtomicU64,
    leaves_crawled: AtomicU64,
    leaves_failed: AtomicU64,
    leaves_truncated: AtomicU64,
    leaves_skipped: AtomicU64,
}

macro_rules! counter {
    ($($inc:ident => $field:ident),* $(,)?) => {
        impl CrawlStats {
            $(
                pub fn $inc(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    fetch_error => fetch_errors,
    fetch_retry => fetch_retries,
    partition_probed => partitions_probed,
    partition_subdivided => partitions_subdivided,
    partition_capped => partitions_capped,
    probe_failed => probe_failures,
    leaf_crawled => leaves_crawled,
    leaf_failed => leaves_failed,
    leaf_truncated => leaves_truncated,
    leaf_skipped => leaves_skipped,
}

impl CrawlStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of ingesting one page of records
    pub fn record_page(&self, observed: u64, inserted: u64, updated: u64, skipped: u64) {
        self.records_observed.fetch_add(observed, Ordering::Relaxed);
        self.inserted.fetch_add(inserted, Ordering::Relaxed);
        self.updated.fetch_add(updated, Ordering::Relaxed);
        self.skipped.fetch_add(skipped, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            records_observed: load(&self.records_observed),
            inserted: load(&self.inserted),
            updated: load(&self.updated),
            skipped: load(&self.skipped),
            fetch_errors: load(&self.fetch_errors),
            fetch_retries: load(&self.fetch_retries),
            partitions_probed: load(&self.partitions_probed),
            partitions_subdivided: load(&self.partitions_subdivided),
            partitions_capped: load(&self.partitions_capped),
            probe_failures: load(&self.probe_failures),
            leaves_crawled: load(&self.leaves_crawled),
            leaves_failed: load(&self.leaves_failed),
            leaves_truncated: load(&self.leaves_truncated),
            leaves_skipped: load(&self.leaves_skipped),
        }
    }
}

/// Plain copy of [`CrawlStats`], persisted on the run row as JSON
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSnapshot {
    pub records_observed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub fetch_errors: u64,
    pub fetch_retries: u64,
    pub partitions_probed: u64,
    pub partitions_subdivided: u64,
    pub partitions_capped: u64,
    pub probe_failures: u64,
    pub leaves_crawled: u64,
    pub leaves_failed: u64,
    /// Leaves cut short by the page cap before reaching their total
    pub leaves_truncated: u64,
    pub leaves_skipped: u64,
}

impl StatsSnapshot {
    /// True when some work could not be completed or fully covered
    pub fn has_gaps(&self) -> bool {
        self.leaves_failed > 0
            || self.leaves_truncated > 0
            || self.probe_failures > 0
            || self.partitions_capped > 0
    }
}
