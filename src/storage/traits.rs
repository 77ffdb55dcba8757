//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::state::{PartitionRange, StatsSnapshot};
use crate::storage::{RawRecord, RecordContext, RunRecord, RunStatus, StoredRecord, UpsertOutcome};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// Every method is a self-contained atomic operation, so implementations can be
/// shared between crawl workers without callers coordinating any locking.
pub trait Storage: Send + Sync {
    // ===== Run Management =====

    /// Creates a new crawl run in the `running` state and returns its ID
    fn create_run(&self, config_hash: &str) -> StorageResult<i64>;

    /// Gets a run by ID
    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord>;

    /// Gets the most recent run
    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Records the final status and statistics of a run
    fn finish_run(&self, run_id: i64, status: RunStatus, stats: &StatsSnapshot)
        -> StorageResult<()>;

    // ===== Resumption =====

    /// Records that a leaf of a segment was fully crawled within a run
    fn mark_leaf_completed(
        &self,
        run_id: i64,
        segment: &str,
        range: PartitionRange,
        records: u64,
    ) -> StorageResult<()>;

    /// Lists the leaves already completed within a run
    fn completed_leaves(&self, run_id: i64) -> StorageResult<Vec<(String, PartitionRange)>>;

    // ===== Records =====

    /// Inserts a record or updates the one sharing its natural key
    ///
    /// Records without a usable natural key are reported as
    /// [`UpsertOutcome::Skipped`] and never stored.
    fn upsert_record(&self, record: &RawRecord, ctx: &RecordContext)
        -> StorageResult<UpsertOutcome>;

    /// Gets a stored record by natural key
    fn get_record(&self, natural_key: &str) -> StorageResult<Option<StoredRecord>>;

    /// Gets the records of a category whose dimension falls in `range`, ordered by dimension
    fn records_in_range(
        &self,
        category: &str,
        range: PartitionRange,
    ) -> StorageResult<Vec<StoredRecord>>;

    // ===== Statistics =====

    /// Counts all stored records
    fn count_records(&self) -> StorageResult<u64>;

    /// Counts stored records per category, largest first
    fn count_by_category(&self) -> StorageResult<Vec<(String, u64)>>;
}
