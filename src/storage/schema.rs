//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the harvester database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Track crawl runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    status TEXT NOT NULL,
    stats_json TEXT
);

-- One row per distinct natural key
CREATE TABLE IF NOT EXISTS listings (
    natural_key TEXT NOT NULL UNIQUE,
    transaction_type TEXT NOT NULL,
    category TEXT NOT NULL,
    zone TEXT,
    dimension REAL,
    payload TEXT NOT NULL,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    first_seen_run INTEGER NOT NULL,
    last_seen_run INTEGER NOT NULL,
    seen_count INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_listings_category ON listings(category);
CREATE INDEX IF NOT EXISTS idx_listings_dimension ON listings(dimension);
CREATE INDEX IF NOT EXISTS idx_listings_category_dimension ON listings(category, dimension);

-- Leaves fully crawled within a run, for resumption
CREATE TABLE IF NOT EXISTS completed_leaves (
    run_id INTEGER NOT NULL REFERENCES runs(id),
    segment TEXT NOT NULL,
    low INTEGER NOT NULL,
    high INTEGER NOT NULL,
    records INTEGER NOT NULL,
    completed_at TEXT NOT NULL,
    PRIMARY KEY (run_id, segment, low, high)
);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
