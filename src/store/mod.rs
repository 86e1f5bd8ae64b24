//! SQLite-backed persisted state.
//!
//! Three logical collections live here: the canonical-id counter, per-source
//! checkpoints, and canonical records. The raw archive shares the same file.
//! Every cross-writer guarantee is enforced by SQLite itself (unique
//! constraints, single-statement increments, version-guarded updates), so
//! separate connections in separate threads or processes can write safely.

pub mod archive;
pub mod checkpoint;
pub mod counter;
pub mod records;

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, params};
use serde::Serialize;

pub use archive::{ArchiveOutcome, sanitize_payload};
pub use records::{InsertOutcome, NewRecord};

pub const SCHEMA_VERSION: i64 = 1;
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored json is invalid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("archive codec error: {0}")]
    Codec(#[from] std::io::Error),
    #[error("unsupported schema version {0}")]
    UnsupportedSchema(i64),
    #[error("offset {0} does not fit in storage")]
    OffsetOverflow(u64),
    #[error("stored offset {0} is negative")]
    NegativeOffset(i64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetSummary {
    pub records_removed: usize,
    pub raw_records_removed: usize,
    pub sources_reset: usize,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                self.create_schema_v1()?;
                self.conn
                    .execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
            }
            SCHEMA_VERSION => self.create_schema_v1()?,
            other => return Err(StoreError::UnsupportedSchema(other)),
        }
        Ok(())
    }

    fn create_schema_v1(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS counters (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                source TEXT PRIMARY KEY,
                skip_offset INTEGER NOT NULL CHECK (skip_offset >= 0),
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS canonical_records (
                canonical_id INTEGER PRIMARY KEY,
                identity_key TEXT NOT NULL UNIQUE,
                ip TEXT NOT NULL,
                mac TEXT NOT NULL,
                hostname TEXT NOT NULL,
                source_ids TEXT NOT NULL,
                version INTEGER NOT NULL CHECK (version >= 1),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS raw_records (
                source TEXT NOT NULL,
                local_id TEXT NOT NULL,
                payload BLOB NOT NULL,
                payload_sha256 TEXT NOT NULL,
                archived_at TEXT NOT NULL,
                PRIMARY KEY (source, local_id)
            );

            CREATE INDEX IF NOT EXISTS idx_raw_records_source ON raw_records(source);
            ",
        )?;
        Ok(())
    }

    /// Administrative reset: drops every canonical record and archived payload,
    /// restarts the id counter and zeroes the checkpoint of each given source.
    pub fn reset_all_state(&self, sources: &[String]) -> Result<ResetSummary, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let records_removed = tx.execute("DELETE FROM canonical_records", [])?;
        let raw_records_removed = tx.execute("DELETE FROM raw_records", [])?;
        tx.execute("DELETE FROM counters", [])?;
        tx.execute("DELETE FROM checkpoints", [])?;
        let now = now_iso8601();
        for source in sources {
            tx.execute(
                "INSERT INTO checkpoints (source, skip_offset, updated_at) VALUES (?1, 0, ?2)",
                params![source, now],
            )?;
        }
        tx.commit()?;
        Ok(ResetSummary {
            records_removed,
            raw_records_removed,
            sources_reset: sources.len(),
        })
    }
}

pub(crate) fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
