//! Storage module for persisting harvested records
//!
//! This module handles all database operations for the harvester, including:
//! - SQLite database initialization and schema management
//! - Atomic upsert of records by natural key
//! - Secondary lookups by category and partitioning dimension
//! - Run tracking and resumption support

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::state::{Segment, StatsSnapshot};
use crate::HarvestError;
use serde_json::{Map, Value};
use std::path::Path;

/// Initializes or opens a storage database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteStorage)` - Successfully initialized storage
/// * `Err(HarvestError)` - Failed to initialize storage
pub fn open_storage(path: &Path) -> Result<SqliteStorage, HarvestError> {
    SqliteStorage::new(path)
}

/// A record as returned by the search API
///
/// Everything except the natural key and the partitioning dimension is opaque
/// payload and stored verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// Stable external identifier, `None` when missing or blank
    pub natural_key: Option<String>,
    /// Value of the partitioning dimension, when present and numeric
    pub dimension: Option<f64>,
    pub payload: Map<String, Value>,
}

impl RawRecord {
    /// Builds a record from an API payload object
    pub fn from_payload(payload: Map<String, Value>, key_field: &str, dimension_field: &str) -> Self {
        let natural_key = payload.get(key_field).and_then(key_from_value);
        let dimension = payload.get(dimension_field).and_then(Value::as_f64);
        Self {
            natural_key,
            dimension,
            payload,
        }
    }
}

/// Accepts non-blank strings and numbers as natural keys
fn key_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Where a record was found, stored alongside it
#[derive(Debug, Clone)]
pub struct RecordContext {
    pub run_id: i64,
    pub transaction: String,
    pub category: String,
    pub zone: Option<String>,
}

impl RecordContext {
    pub fn new(run_id: i64, segment: &Segment) -> Self {
        Self {
            run_id,
            transaction: segment.transaction.clone(),
            category: segment.category.clone(),
            zone: segment.zone.clone(),
        }
    }
}

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First time this natural key was seen
    Inserted,
    /// The key existed; payload and `last_seen_at` were refreshed
    Updated,
    /// The record had no natural key and was not stored
    Skipped,
}

/// Represents a record in the database
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub natural_key: String,
    pub transaction: String,
    pub category: String,
    pub zone: Option<String>,
    pub dimension: Option<f64>,
    pub payload: Map<String, Value>,
    pub first_seen_at: String,
    pub last_seen_at: String,
    pub first_seen_run: i64,
    pub last_seen_run: i64,
    pub seen_count: u64,
}

/// Represents a crawl run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
    pub stats: Option<StatsSnapshot>,
}

/// Status of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    /// Finished, but some leaves failed or some partitions were capped
    Partial,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "partial" => Some(Self::Partial),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether a later invocation should pick this run up again
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Running | Self::Interrupted | Self::Failed)
    }
}
