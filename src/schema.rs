//! # SQLite Schema for a Collection
//!
//! Each collection is one SQLite database holding two tables:
//!
//! ```text
//! records                          changelog
//! ┌─────────────────────┐          ┌──────────────────────────┐
//! │ key   BLOB PK       │          │ seq        INTEGER PK    │
//! │ value BLOB          │          │ created_ms INTEGER       │
//! └─────────────────────┘          │ batch      BLOB          │
//!   the ordered KV store           └──────────────────────────┘
//!   (namespaced by the               the shipped write log,
//!    key's leading byte)             one row per committed batch
//! ```
//!
//! ## Why a Single BLOB-Keyed Table?
//!
//! SQLite orders BLOB primary keys by memcmp, which is exactly the contract
//! the record codec encodes into its keys: byte order over `records.key`
//! equals `(urlkey, timestamp, filename, offset)` order. Captures, aliases,
//! access rules, policies, and metadata share the table, kept disjoint by the
//! codec's namespace byte, so one range scan strategy serves every keyspace.
//!
//! ## Why `WITHOUT ROWID`?
//!
//! The key is the clustering key. Without the rowid indirection, a range scan
//! walks the B-tree in key order directly, and there is no shadow index to
//! keep in sync on writes.
//!
//! ## The Changelog
//!
//! Every committed batch appends one row: the batch's sequence number and the
//! codec's opaque op blob. Secondaries tail this table through the change
//! feed and apply the blobs verbatim. `truncate_replication` deletes rows,
//! after which older cursors get `SequenceTruncated`.

use std::path::Path;

use rusqlite::Connection;

use crate::error::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. A mismatch on open is an error, not a migration;
/// upgrades that change the schema ship their own migration tooling.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// Collection metadata (schema version and similar bookkeeping).
///
/// Record-level metadata (sequence counters) lives in the `records` table
/// under the meta namespace so it participates in write batches; this table
/// only holds facts about the database file itself.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// The ordered key-value store. `key` carries the codec's namespace byte and
/// packed components; `value` the versioned record payload.
const CREATE_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    key   BLOB PRIMARY KEY,
    value BLOB NOT NULL
) WITHOUT ROWID
"#;

/// The replication log: one row per committed write batch.
///
/// `seq` is assigned by the commit path (strictly increasing, starts at 1)
/// and `batch` is the codec's checksummed op blob.
const CREATE_CHANGELOG: &str = r#"
CREATE TABLE IF NOT EXISTS changelog (
    seq        INTEGER PRIMARY KEY,
    created_ms INTEGER NOT NULL,
    batch      BLOB NOT NULL
)
"#;

// =============================================================================
// Database
// =============================================================================

/// An initialized collection database.
///
/// Thin wrapper that owns the connection through schema setup; callers take
/// the connection out with [`Database::into_connection`] once initialization
/// succeeded.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (creating if needed) a collection database at `path` and
    /// ensures the schema exists and matches [`SCHEMA_VERSION`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// Opens an in-memory database. Snapshot iteration needs a file-backed
    /// database (separate read connections), so this is for unit tests of
    /// the write path only.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        // WAL keeps readers unblocked during commits; NORMAL sync is the
        // standard WAL durability trade. The busy timeout covers the short
        // write-write contention between commits and background maintenance.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        conn.execute_batch(CREATE_METADATA)?;
        conn.execute_batch(CREATE_RECORDS)?;
        conn.execute_batch(CREATE_CHANGELOG)?;

        let db = Self { conn };
        db.check_schema_version()?;
        Ok(db)
    }

    /// Verifies the stored schema version, stamping it on first open.
    fn check_schema_version(&self) -> Result<()> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match stored {
            None => {
                self.conn.execute(
                    "INSERT INTO metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
                Ok(())
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => Ok(()),
            Some(v) => Err(Error::Corrupt(format!(
                "schema version mismatch: found {v}, expected {SCHEMA_VERSION}"
            ))),
        }
    }

    /// Takes ownership of the initialized connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_schema() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.into_connection();

        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('metadata', 'records', 'changelog')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_reopen_keeps_version() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("coll.db");

        drop(Database::open(&path).unwrap());
        // second open must accept the stamped version
        drop(Database::open(&path).unwrap());
    }

    #[test]
    fn test_version_mismatch_detected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("coll.db");
        drop(Database::open(&path).unwrap());

        let conn = Connection::open(&path).unwrap();
        conn.execute("UPDATE metadata SET value = '99' WHERE key = 'schema_version'", [])
            .unwrap();
        drop(conn);

        assert!(matches!(Database::open(&path), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_blob_keys_sort_by_memcmp() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.into_connection();

        for key in [vec![0x02u8], vec![0x01, 0xFF], vec![0x01, 0x00], vec![0x01]] {
            conn.execute(
                "INSERT INTO records (key, value) VALUES (?, x'00')",
                [key],
            )
            .unwrap();
        }

        let mut stmt = conn.prepare("SELECT key FROM records ORDER BY key").unwrap();
        let keys: Vec<Vec<u8>> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(
            keys,
            vec![vec![0x01], vec![0x01, 0x00], vec![0x01, 0xFF], vec![0x02]]
        );
    }
}
