//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::state::{PartitionRange, StatsSnapshot};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{RawRecord, RecordContext, RunRecord, RunStatus, StoredRecord, UpsertOutcome};
use crate::HarvestError;
use chrono::{SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const RECORD_COLUMNS: &str = "natural_key, transaction_type, category, zone, dimension, payload,
     first_seen_at, last_seen_at, first_seen_run, last_seen_run, seen_count";

/// Single-statement insert-or-update keyed by natural key
///
/// `seen_count` comes back as 1 only when the row was created by this statement,
/// so concurrent writers racing on a new key resolve to one insert and updates.
const UPSERT_SQL: &str = "
    INSERT INTO listings (natural_key, transaction_type, category, zone, dimension, payload,
                          first_seen_at, last_seen_at, first_seen_run, last_seen_run, seen_count)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?8, 1)
    ON CONFLICT(natural_key) DO UPDATE SET
        transaction_type = excluded.transaction_type,
        category = excluded.category,
        zone = excluded.zone,
        dimension = excluded.dimension,
        payload = excluded.payload,
        last_seen_at = excluded.last_seen_at,
        last_seen_run = excluded.last_seen_run,
        seen_count = listings.seen_count + 1
    RETURNING seen_count";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(HarvestError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, HarvestError> {
        let conn = Connection::open(path)?;

        // Configure SQLite for better performance
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        // Initialize schema
        initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> Result<Self, HarvestError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Database(format!("Connection lock poisoned: {}", e)))
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let stats_json: Option<String> = row.get(5)?;
    Ok(RunRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        config_hash: row.get(3)?,
        status: RunStatus::from_db_string(&row.get::<_, String>(4)?)
            .unwrap_or(RunStatus::Running),
        stats: stats_json.and_then(|json| serde_json::from_str(&json).ok()),
    })
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<StoredRecord> {
    let payload: String = row.get(5)?;
    let payload = serde_json::from_str(&payload)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(StoredRecord {
        natural_key: row.get(0)?,
        transaction: row.get(1)?,
        category: row.get(2)?,
        zone: row.get(3)?,
        dimension: row.get(4)?,
        payload,
        first_seen_at: row.get(6)?,
        last_seen_at: row.get(7)?,
        first_seen_run: row.get(8)?,
        last_seen_run: row.get(9)?,
        seen_count: row.get::<_, i64>(10)? as u64,
    })
}

impl Storage for SqliteStorage {
    // ===== Run Management =====

    fn create_run(&self, config_hash: &str) -> StorageResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO runs (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
            params![now(), config_hash, RunStatus::Running.to_db_string()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, started_at, finished_at, config_hash, status, stats_json
             FROM runs WHERE id = ?1",
            params![run_id],
            row_to_run,
        )
        .optional()?
        .ok_or(StorageError::RunNotFound(run_id))
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let conn = self.conn()?;
        let run = conn
            .query_row(
                "SELECT id, started_at, finished_at, config_hash, status, stats_json
                 FROM runs ORDER BY id DESC LIMIT 1",
                [],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        stats: &StatsSnapshot,
    ) -> StorageResult<()> {
        let stats_json = serde_json::to_string(stats)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, stats_json = ?3 WHERE id = ?4",
            params![status.to_db_string(), now(), stats_json, run_id],
        )?;
        if changed == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    // ===== Resumption =====

    fn mark_leaf_completed(
        &self,
        run_id: i64,
        segment: &str,
        range: PartitionRange,
        records: u64,
    ) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO completed_leaves (run_id, segment, low, high, records, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![run_id, segment, range.low, range.high, records as i64, now()],
        )?;
        Ok(())
    }

    fn completed_leaves(&self, run_id: i64) -> StorageResult<Vec<(String, PartitionRange)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT segment, low, high FROM completed_leaves WHERE run_id = ?1 ORDER BY segment, low",
        )?;

        let leaves = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    PartitionRange {
                        low: row.get(1)?,
                        high: row.get(2)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(leaves)
    }

    // ===== Records =====

    fn upsert_record(
        &self,
        record: &RawRecord,
        ctx: &RecordContext,
    ) -> StorageResult<UpsertOutcome> {
        let Some(key) = record.natural_key.as_deref().filter(|k| !k.trim().is_empty()) else {
            return Ok(UpsertOutcome::Skipped);
        };

        let payload = serde_json::to_string(&record.payload)?;
        let conn = self.conn()?;
        let seen_count: i64 = conn.query_row(
            UPSERT_SQL,
            params![
                key,
                ctx.transaction,
                ctx.category,
                ctx.zone,
                record.dimension,
                payload,
                now(),
                ctx.run_id
            ],
            |row| row.get(0),
        )?;

        Ok(if seen_count == 1 {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    fn get_record(&self, natural_key: &str) -> StorageResult<Option<StoredRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM listings WHERE natural_key = ?1", RECORD_COLUMNS),
                params![natural_key],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn records_in_range(
        &self,
        category: &str,
        range: PartitionRange,
    ) -> StorageResult<Vec<StoredRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM listings
             WHERE category = ?1 AND dimension >= ?2 AND dimension < ?3
             ORDER BY dimension, natural_key",
            RECORD_COLUMNS
        ))?;

        let records = stmt
            .query_map(params![category, range.low, range.high], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    // ===== Statistics =====

    fn count_records(&self) -> StorageResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM listings", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn count_by_category(&self) -> StorageResult<Vec<(String, u64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT category, COUNT(*) AS count FROM listings
             GROUP BY category ORDER BY count DESC, category",
        )?;

        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(counts)
    }
}
