//! # The Capture Index
//!
//! One [`Index`] wraps one collection's ordered store and exposes everything
//! the query, ingest, access-control, and replication layers need: scans,
//! batched writes, alias resolution, the change log, and operational knobs.
//!
//! ## Read / Write Split
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Index                               │
//! │                                                              │
//! │   writer: Mutex<Connection>      reader: Mutex<Connection>   │
//! │   (read-write, one at a time)    (read-only, point lookups)  │
//! │                                                              │
//! │   RecordScan / CaptureIter / ChangeCursor                    │
//! │   (each owns its own read-only connection + snapshot)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes are serialized behind the writer mutex and committed with
//! `BEGIN IMMEDIATE`, which is what makes sequence-number assignment safe
//! even when background maintenance opens its own write connection.
//!
//! ## Iterator Contract
//!
//! Every scan owns a dedicated read-only connection with an open read
//! transaction, pinned at creation. Writes committed after the scan opened
//! are invisible to it, and dropping the scan releases the transaction and
//! the connection on every exit path. There is nothing to double-free and
//! no way to use a closed iterator: closing *is* dropping.
//!
//! ## Batches
//!
//! [`Index::begin_update`] returns a [`Batch`] that stages mutations in
//! memory. `commit` applies them atomically under one sequence number and
//! appends one changelog row; dropping the batch instead discards every
//! staged op. Oversized batches fail with [`Error::BatchTooLarge`] at
//! staging time, before anything touches the database.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::access::AccessStore;
use crate::codec::{
    self, alias_key, alias_key_prefix, capture_key_prefix, decode_alias, decode_capture,
    encode_alias, encode_batch_ops, meta_key, prefix_successor, BatchOp, NS_ALIAS, NS_CAPTURE,
    NS_POLICY, NS_RULE,
};
use crate::error::{Error, Result};
use crate::records::{current_time_ms, validate_timestamp, Alias, Capture, SeqNo};
use crate::schema::Database;

// =============================================================================
// Limits
// =============================================================================

/// Maximum bytes a single batch may stage.
pub const MAX_BATCH_BYTES: usize = 64 * 1024 * 1024;

/// Rows fetched per chunk by scan iterators.
const SCAN_CHUNK: usize = 256;

/// Entries kept in the alias lookup cache.
const ALIAS_CACHE_SIZE: usize = 4096;

/// Meta-namespace key holding the latest committed sequence number.
const META_LATEST_SEQ: &str = "latest_seq";

// =============================================================================
// Index
// =============================================================================

/// One collection's ordered store.
pub struct Index {
    name: String,
    path: PathBuf,
    writable: bool,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    alias_cache: Mutex<LruCache<String, Option<String>>>,
    access: AccessStore,
    compacting: Arc<AtomicBool>,
    upgrading: Arc<AtomicBool>,
}

impl Index {
    /// Opens (creating if necessary) the collection database at `path`.
    ///
    /// `writable` is false on secondaries that do not accept writes; the
    /// replication apply path stays available regardless.
    pub fn open(name: &str, path: &Path, writable: bool) -> Result<Index> {
        let writer = Database::open(path)?.into_connection();
        let reader = open_read_only(path)?;

        let index = Index {
            name: name.to_string(),
            path: path.to_path_buf(),
            writable,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            alias_cache: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(ALIAS_CACHE_SIZE).expect("nonzero"),
            )),
            access: AccessStore::new(),
            compacting: Arc::new(AtomicBool::new(false)),
            upgrading: Arc::new(AtomicBool::new(false)),
        };

        index.load_access_store()?;
        Ok(index)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn access_store(&self) -> &AccessStore {
        &self.access
    }

    /// Rebuilds the in-memory rule/policy store from the persisted
    /// keyspaces. Called once at open.
    fn load_access_store(&self) -> Result<()> {
        for ns in [NS_RULE, NS_POLICY] {
            let rows = self.read_range_once(vec![ns], Some(vec![ns + 1]))?;
            for (key, value) in rows {
                self.access.apply_op(&BatchOp::Put { key, value });
            }
        }
        Ok(())
    }

    // =========================================================================
    // Point Reads
    // =========================================================================

    /// Fetches one raw record by exact key.
    pub(crate) fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare_cached("SELECT value FROM records WHERE key = ?")?;
        match stmt.query_row([key], |row| row.get::<_, Vec<u8>>(0)) {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads a bounded range in one shot, without snapshot pinning. Only for
    /// small keyspaces (access rules at open).
    fn read_range_once(
        &self,
        lower: Vec<u8>,
        upper: Option<Vec<u8>>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let conn = self.reader.lock();
        let mut out = Vec::new();
        match upper {
            Some(upper) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT key, value FROM records WHERE key >= ? AND key < ? ORDER BY key",
                )?;
                let rows = stmt.query_map(params![lower, upper], |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare_cached("SELECT key, value FROM records WHERE key >= ? ORDER BY key")?;
                let rows = stmt.query_map(params![lower], |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Resolves a urlkey through the alias table: one hop, never chased
    /// through a second alias.
    pub fn resolve_alias(&self, urlkey: &str) -> Result<Option<String>> {
        if let Some(cached) = self.alias_cache.lock().get(urlkey) {
            return Ok(cached.clone());
        }
        let key = alias_key(urlkey);
        let target = match self.get_raw(&key)? {
            Some(value) => Some(decode_alias(&key, &value)?.target),
            None => None,
        };
        self.alias_cache.lock().put(urlkey.to_string(), target.clone());
        Ok(target)
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// Forward scan over captures whose urlkey is at or after `key`.
    pub fn captures_after(&self, key: &str) -> Result<CaptureIter> {
        let bounds = ScanBounds {
            lower: capture_key_prefix(key),
            upper: Some(vec![NS_CAPTURE + 1]),
            reverse: false,
        };
        Ok(CaptureIter::new(RecordScan::open(&self.path, bounds)?))
    }

    /// Reverse scan over captures whose urlkey is at or before `key`.
    pub fn captures_after_reverse(&self, key: &str) -> Result<CaptureIter> {
        let upper = prefix_successor(&capture_key_prefix(key)).unwrap_or(vec![NS_CAPTURE + 1]);
        let bounds = ScanBounds {
            lower: vec![NS_CAPTURE],
            upper: Some(upper),
            reverse: true,
        };
        Ok(CaptureIter::new(RecordScan::open(&self.path, bounds)?))
    }

    /// Byte-range capture scan used by the query planner.
    pub(crate) fn scan_captures(&self, bounds: ScanBounds) -> Result<CaptureIter> {
        Ok(CaptureIter::new(RecordScan::open(&self.path, bounds)?))
    }

    /// Forward scan over aliases whose key starts with `prefix`.
    pub fn list_aliases(&self, prefix: &str) -> Result<AliasIter> {
        let lower = alias_key_prefix(prefix);
        let upper = prefix_successor(&lower).unwrap_or(vec![NS_ALIAS + 1]);
        let bounds = ScanBounds {
            lower,
            upper: Some(upper),
            reverse: false,
        };
        Ok(AliasIter::new(RecordScan::open(&self.path, bounds)?))
    }

    /// Engine-level estimate of how many captures the collection holds.
    pub fn estimated_record_count(&self) -> Result<u64> {
        let conn = self.reader.lock();
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM records WHERE key >= ? AND key < ?",
            params![vec![NS_CAPTURE], vec![NS_ALIAS]],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Engine statistics for the stats endpoint: the estimated record count
    /// plus any requested engine properties (read-only pragmas). Unknown or
    /// failing properties report an error string in place of a value.
    pub fn stats(&self, properties: &[&str]) -> Result<serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert(
            "estimatedRecordCount".to_string(),
            serde_json::Value::from(self.estimated_record_count()?),
        );

        let conn = self.reader.lock();
        for property in properties.iter().filter(|p| !p.is_empty()) {
            let value = if property.bytes().all(|b| b.is_ascii_lowercase() || b == b'_') {
                conn.query_row(&format!("PRAGMA {property}"), [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(serde_json::Value::from)
                .unwrap_or_else(|e| serde_json::Value::from(format!("ERROR: {e}")))
            } else {
                serde_json::Value::from("ERROR: invalid property name")
            };
            map.insert(property.to_string(), value);
        }
        Ok(serde_json::Value::Object(map))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Starts a write batch.
    ///
    /// The batch stages mutations in memory; nothing is visible until
    /// `commit`, and dropping the batch discards it.
    pub fn begin_update(&self) -> Result<Batch<'_>> {
        if !self.writable {
            return Err(Error::Forbidden(
                "this node is running in secondary mode to an upstream primary and does not accept writes"
                    .to_string(),
            ));
        }
        Ok(Batch {
            index: self,
            ops: Vec::new(),
            staged: 0,
            touched_aliases: false,
            touched_access: false,
        })
    }

    /// Applies an opaque write batch received from a primary.
    ///
    /// Idempotent: a batch at or below the latest applied sequence number is
    /// skipped, so secondaries may safely replay after a crash between apply
    /// and checkpoint.
    pub fn apply_raw_batch(&self, seq: SeqNo, blob: &[u8]) -> Result<()> {
        let ops = codec::decode_batch_ops(blob)?;

        let mut conn = self.writer.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let latest = read_latest_seq(&tx)?;
        if seq <= latest {
            debug!(collection = %self.name, seq = %seq, "skipping already-applied batch");
            return Ok(());
        }
        for op in &ops {
            apply_op(&tx, op)?;
        }
        tx.execute(
            "INSERT OR IGNORE INTO changelog (seq, created_ms, batch) VALUES (?, ?, ?)",
            params![seq.as_raw() as i64, current_time_ms() as i64, blob],
        )?;
        write_latest_seq(&tx, seq)?;
        tx.commit()?;
        drop(conn);

        self.after_commit(&ops);
        debug!(collection = %self.name, seq = %seq, ops = ops.len(), "applied replicated batch");
        Ok(())
    }

    /// Post-commit bookkeeping shared by local commits and replicated
    /// applies: alias cache invalidation and the in-memory rule store.
    fn after_commit(&self, ops: &[BatchOp]) {
        if ops.iter().any(|op| op.key().first() == Some(&NS_ALIAS)) {
            self.alias_cache.lock().clear();
        }
        for op in ops {
            match op.key().first() {
                Some(&NS_RULE) | Some(&NS_POLICY) => self.access.apply_op(op),
                _ => {}
            }
        }
    }

    // =========================================================================
    // Sequence Numbers & Change Log
    // =========================================================================

    /// The sequence number of the most recently committed batch.
    pub fn latest_sequence_number(&self) -> Result<SeqNo> {
        let conn = self.reader.lock();
        read_latest_seq(&conn)
    }

    /// Opens a cursor over the write log strictly after `since`.
    ///
    /// Fails with [`Error::SequenceTruncated`] when `since` predates the
    /// oldest retained changelog row.
    pub fn get_updates_since(&self, since: SeqNo) -> Result<crate::feed::ChangeCursor> {
        let conn = open_read_only(&self.path)?;
        crate::feed::ChangeCursor::open(conn, since)
    }

    /// Flushes the WAL and prunes the replication log.
    ///
    /// After this, change-feed cursors must resume from the current latest
    /// sequence number; anything older fails `SequenceTruncated`.
    pub fn flush_wal(&self) -> Result<()> {
        let conn = self.writer.lock();
        conn.execute("DELETE FROM changelog", [])?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_row| Ok(()))?;
        info!(collection = %self.name, "replication log truncated");
        Ok(())
    }

    // =========================================================================
    // Background Maintenance
    // =========================================================================

    /// Schedules a VACUUM on a background thread.
    ///
    /// Returns true when scheduled, false when a compaction is already
    /// running. Compaction is not cancelable; it is bounded by the size of
    /// the database.
    pub fn compact_in_background(&self) -> bool {
        if self.compacting.swap(true, Ordering::SeqCst) {
            return false;
        }
        let flag = Arc::clone(&self.compacting);
        let path = self.path.clone();
        let name = self.name.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("cdxdb-compact-{name}"))
            .spawn(move || {
                let result = Connection::open(&path).and_then(|conn| {
                    conn.busy_timeout(std::time::Duration::from_secs(600))?;
                    conn.execute_batch("VACUUM")
                });
                match result {
                    Ok(()) => info!(collection = %name, "compaction finished"),
                    Err(e) => warn!(collection = %name, error = %e, "compaction failed"),
                }
                flag.store(false, Ordering::SeqCst);
            })
            .is_ok();
        if !spawned {
            self.compacting.store(false, Ordering::SeqCst);
        }
        spawned
    }

    /// Schedules a background rewrite of every capture value at the current
    /// codec version.
    ///
    /// Returns true when scheduled, false when an upgrade is already
    /// running. Rewrites flow through the normal commit path, so secondaries
    /// receive them over the change feed.
    pub fn upgrade_in_background(&self) -> bool {
        if self.upgrading.swap(true, Ordering::SeqCst) {
            return false;
        }
        let flag = Arc::clone(&self.upgrading);
        let path = self.path.clone();
        let name = self.name.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("cdxdb-upgrade-{name}"))
            .spawn(move || {
                match upgrade_pass(&path) {
                    Ok(rewritten) => {
                        info!(collection = %name, rewritten, "upgrade finished")
                    }
                    Err(e) => warn!(collection = %name, error = %e, "upgrade failed"),
                }
                flag.store(false, Ordering::SeqCst);
            })
            .is_ok();
        if !spawned {
            self.upgrading.store(false, Ordering::SeqCst);
        }
        spawned
    }
}

/// Re-encodes every capture value, committing changed records in batches.
fn upgrade_pass(path: &Path) -> Result<u64> {
    let mut conn = Database::open(path)?.into_connection();
    let mut resume = vec![NS_CAPTURE];
    let mut rewritten = 0u64;

    loop {
        let rows = {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM records WHERE key >= ? AND key < ? ORDER BY key LIMIT ?",
            )?;
            let rows = stmt.query_map(
                params![resume, vec![NS_ALIAS], SCAN_CHUNK as i64],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        let Some((last_key, _)) = rows.last().cloned() else {
            break;
        };

        let mut ops = Vec::new();
        for (key, value) in &rows {
            let capture = decode_capture(key, value)?;
            let (_, fresh) = codec::encode_capture(&capture);
            if &fresh != value {
                ops.push(BatchOp::Put {
                    key: key.clone(),
                    value: fresh,
                });
            }
        }
        if !ops.is_empty() {
            rewritten += ops.len() as u64;
            commit_ops(&mut conn, &ops)?;
        }

        if rows.len() < SCAN_CHUNK {
            break;
        }
        resume = last_key;
        resume.push(0x00);
    }
    Ok(rewritten)
}

// =============================================================================
// Batch
// =============================================================================

/// A staged group of mutations, committed atomically under one sequence
/// number.
///
/// Dropping a batch without committing discards every staged op and leaves
/// the sequence number untouched.
pub struct Batch<'a> {
    index: &'a Index,
    ops: Vec<BatchOp>,
    staged: usize,
    touched_aliases: bool,
    touched_access: bool,
}

impl<'a> Batch<'a> {
    /// Stages a capture upsert.
    pub fn put_capture(&mut self, capture: &Capture) -> Result<()> {
        validate_timestamp(capture.timestamp)?;
        let (key, value) = codec::encode_capture(capture);
        self.push(BatchOp::Put { key, value })
    }

    /// Stages a capture delete, keyed by the capture's primary-key fields.
    pub fn delete_capture(&mut self, capture: &Capture) -> Result<()> {
        validate_timestamp(capture.timestamp)?;
        self.push(BatchOp::Delete {
            key: codec::capture_key(capture),
        })
    }

    /// Stages an alias upsert. Both keys must already be in SURT form.
    pub fn put_alias(&mut self, alias_surt: &str, target_surt: &str) -> Result<()> {
        let (key, value) = encode_alias(&Alias::new(alias_surt, target_surt));
        self.touched_aliases = true;
        self.push(BatchOp::Put { key, value })
    }

    /// Stages an alias delete.
    pub fn delete_alias(&mut self, alias_surt: &str) -> Result<()> {
        self.touched_aliases = true;
        self.push(BatchOp::Delete {
            key: alias_key(alias_surt),
        })
    }

    /// Stages a raw put (access-control keyspaces).
    pub(crate) fn put_raw(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.touched_access = true;
        self.push(BatchOp::Put { key, value })
    }

    /// Stages a raw delete (access-control keyspaces).
    pub(crate) fn delete_raw(&mut self, key: Vec<u8>) -> Result<()> {
        self.touched_access = true;
        self.push(BatchOp::Delete { key })
    }

    fn push(&mut self, op: BatchOp) -> Result<()> {
        let size = self.staged + op.staged_size();
        if size > MAX_BATCH_BYTES {
            return Err(Error::BatchTooLarge {
                size,
                max: MAX_BATCH_BYTES,
            });
        }
        self.staged = size;
        self.ops.push(op);
        Ok(())
    }

    /// Number of staged ops.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Commits every staged op atomically and returns the batch's sequence
    /// number.
    ///
    /// An empty batch is a no-op: nothing is written and the sequence number
    /// does not advance.
    pub fn commit(self) -> Result<SeqNo> {
        let mut conn = self.index.writer.lock();
        let seq = commit_ops(&mut conn, &self.ops)?;
        drop(conn);

        if self.touched_aliases || self.touched_access {
            self.index.after_commit(&self.ops);
        }
        debug!(
            collection = %self.index.name,
            seq = %seq,
            ops = self.ops.len(),
            "committed batch"
        );
        Ok(seq)
    }
}

/// Applies `ops` in one `BEGIN IMMEDIATE` transaction, appends the changelog
/// row, and advances the sequence counter.
fn commit_ops(conn: &mut Connection, ops: &[BatchOp]) -> Result<SeqNo> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let latest = read_latest_seq(&tx)?;
    if ops.is_empty() {
        return Ok(latest);
    }
    let seq = latest.next();

    for op in ops {
        apply_op(&tx, op)?;
    }
    tx.execute(
        "INSERT INTO changelog (seq, created_ms, batch) VALUES (?, ?, ?)",
        params![
            seq.as_raw() as i64,
            current_time_ms() as i64,
            encode_batch_ops(ops)
        ],
    )?;
    write_latest_seq(&tx, seq)?;
    tx.commit()?;
    Ok(seq)
}

fn apply_op(conn: &Connection, op: &BatchOp) -> Result<()> {
    match op {
        BatchOp::Put { key, value } => {
            conn.execute(
                "INSERT OR REPLACE INTO records (key, value) VALUES (?, ?)",
                params![key, value],
            )?;
        }
        BatchOp::Delete { key } => {
            conn.execute("DELETE FROM records WHERE key = ?", params![key])?;
        }
    }
    Ok(())
}

pub(crate) fn read_latest_seq(conn: &Connection) -> Result<SeqNo> {
    let mut stmt = conn.prepare_cached("SELECT value FROM records WHERE key = ?")?;
    match stmt.query_row([meta_key(META_LATEST_SEQ)], |row| row.get::<_, Vec<u8>>(0)) {
        Ok(bytes) => {
            let raw: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::Corrupt("malformed sequence counter".to_string()))?;
            Ok(SeqNo::from_raw(u64::from_le_bytes(raw)))
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(SeqNo::ZERO),
        Err(e) => Err(e.into()),
    }
}

fn write_latest_seq(conn: &Connection, seq: SeqNo) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO records (key, value) VALUES (?, ?)",
        params![meta_key(META_LATEST_SEQ), seq.as_raw().to_le_bytes().to_vec()],
    )?;
    Ok(())
}

fn open_read_only(path: &Path) -> Result<Connection> {
    Ok(Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?)
}

// =============================================================================
// Scan Iterators
// =============================================================================

/// Byte range for a scan: `lower` inclusive, `upper` exclusive.
pub(crate) struct ScanBounds {
    pub lower: Vec<u8>,
    pub upper: Option<Vec<u8>>,
    pub reverse: bool,
}

/// A chunked scan over the ordered store, pinned to a snapshot.
///
/// Owns its read-only connection. A read transaction is opened (and the
/// snapshot materialized) at creation, so concurrent commits are never
/// observed mid-iteration; the transaction is released on drop.
pub struct RecordScan {
    conn: Connection,
    lower: Vec<u8>,
    upper: Option<Vec<u8>>,
    reverse: bool,
    buffer: std::collections::VecDeque<(Vec<u8>, Vec<u8>)>,
    exhausted: bool,
}

impl RecordScan {
    pub(crate) fn open(path: &Path, bounds: ScanBounds) -> Result<RecordScan> {
        let conn = open_read_only(path)?;
        // Pin the snapshot now: BEGIN alone defers it to the first read.
        conn.execute_batch("BEGIN")?;
        conn.query_row("SELECT count(*) FROM metadata", [], |_row| Ok(()))?;

        Ok(RecordScan {
            conn,
            lower: bounds.lower,
            upper: bounds.upper,
            reverse: bounds.reverse,
            buffer: std::collections::VecDeque::new(),
            exhausted: false,
        })
    }

    fn fetch_chunk(&mut self) -> Result<()> {
        let chunk = SCAN_CHUNK as i64;
        let rows: Vec<(Vec<u8>, Vec<u8>)> = {
            let (sql, params): (&str, Vec<&dyn rusqlite::ToSql>) =
                match (&self.upper, self.reverse) {
                    (Some(upper), false) => (
                        "SELECT key, value FROM records WHERE key >= ?1 AND key < ?2
                         ORDER BY key LIMIT ?3",
                        vec![&self.lower, upper, &chunk],
                    ),
                    (None, false) => (
                        "SELECT key, value FROM records WHERE key >= ?1
                         ORDER BY key LIMIT ?2",
                        vec![&self.lower, &chunk],
                    ),
                    (Some(upper), true) => (
                        "SELECT key, value FROM records WHERE key >= ?1 AND key < ?2
                         ORDER BY key DESC LIMIT ?3",
                        vec![&self.lower, upper, &chunk],
                    ),
                    (None, true) => (
                        "SELECT key, value FROM records WHERE key >= ?1
                         ORDER BY key DESC LIMIT ?2",
                        vec![&self.lower, &chunk],
                    ),
                };
            let mut stmt = self.conn.prepare_cached(sql)?;
            let mapped = stmt.query_map(&params[..], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            mapped.collect::<std::result::Result<Vec<_>, _>>()?
        };

        if rows.len() < SCAN_CHUNK {
            self.exhausted = true;
        }
        if let Some((last_key, _)) = rows.last() {
            if self.reverse {
                // next chunk strictly below the smallest key seen
                self.upper = Some(last_key.clone());
            } else {
                // next chunk strictly above the largest key seen; appending
                // 0x00 forms the immediate successor in byte order
                let mut next = last_key.clone();
                next.push(0x00);
                self.lower = next;
            }
        }
        self.buffer.extend(rows);
        Ok(())
    }
}

impl Iterator for RecordScan {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_chunk() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl Drop for RecordScan {
    fn drop(&mut self) {
        let _ = self.conn.execute_batch("ROLLBACK");
    }
}

/// A scan decoded into [`Capture`]s.
pub struct CaptureIter {
    scan: RecordScan,
}

impl CaptureIter {
    pub(crate) fn new(scan: RecordScan) -> Self {
        Self { scan }
    }
}

impl Iterator for CaptureIter {
    type Item = Result<Capture>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.scan.next()?;
        Some(item.and_then(|(key, value)| decode_capture(&key, &value)))
    }
}

/// A scan decoded into [`Alias`]es.
pub struct AliasIter {
    scan: RecordScan,
}

impl AliasIter {
    pub(crate) fn new(scan: RecordScan) -> Self {
        Self { scan }
    }
}

impl Iterator for AliasIter {
    type Item = Result<Alias>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.scan.next()?;
        Some(item.and_then(|(key, value)| decode_alias(&key, &value)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_index() -> (tempfile::TempDir, Index) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let index = Index::open("test", &path, true).unwrap();
        (dir, index)
    }

    fn capture(urlkey: &str, timestamp: u64) -> Capture {
        Capture {
            urlkey: urlkey.to_string(),
            timestamp,
            original_url: format!("http://{urlkey}"),
            filename: "a.warc.gz".to_string(),
            ..Capture::default()
        }
    }

    fn put_all(index: &Index, captures: &[Capture]) -> SeqNo {
        let mut batch = index.begin_update().unwrap();
        for c in captures {
            batch.put_capture(c).unwrap();
        }
        batch.commit().unwrap()
    }

    #[test]
    fn test_put_then_scan_in_key_order() {
        let (_dir, index) = open_test_index();
        put_all(
            &index,
            &[
                capture("com,example)/b", 2),
                capture("com,example)/a", 1),
                capture("com,example)/a", 3),
            ],
        );

        let keys: Vec<(String, u64)> = index
            .captures_after("")
            .unwrap()
            .map(|c| c.unwrap())
            .map(|c| (c.urlkey, c.timestamp))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("com,example)/a".to_string(), 1),
                ("com,example)/a".to_string(), 3),
                ("com,example)/b".to_string(), 2),
            ]
        );
    }

    #[test]
    fn test_duplicate_put_is_idempotent_upsert() {
        let (_dir, index) = open_test_index();
        let c = capture("com,example)/", 1);
        put_all(&index, &[c.clone()]);
        put_all(&index, &[c]);
        assert_eq!(index.estimated_record_count().unwrap(), 1);
    }

    #[test]
    fn test_sequence_numbers_strictly_increase() {
        let (_dir, index) = open_test_index();
        let s1 = put_all(&index, &[capture("a", 1)]);
        let s2 = put_all(&index, &[capture("b", 1)]);
        let s3 = put_all(&index, &[capture("c", 1)]);
        assert!(s1 < s2 && s2 < s3);
        assert_eq!(index.latest_sequence_number().unwrap(), s3);
    }

    #[test]
    fn test_dropped_batch_discards_and_keeps_sequence() {
        let (_dir, index) = open_test_index();
        let before = index.latest_sequence_number().unwrap();
        {
            let mut batch = index.begin_update().unwrap();
            batch.put_capture(&capture("com,example)/", 1)).unwrap();
            // dropped without commit
        }
        assert_eq!(index.latest_sequence_number().unwrap(), before);
        assert_eq!(index.estimated_record_count().unwrap(), 0);
    }

    #[test]
    fn test_empty_commit_does_not_advance_sequence() {
        let (_dir, index) = open_test_index();
        let s1 = put_all(&index, &[capture("a", 1)]);
        let batch = index.begin_update().unwrap();
        let s2 = batch.commit().unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_batch_too_large() {
        let (_dir, index) = open_test_index();
        let mut batch = index.begin_update().unwrap();
        let mut big = capture("com,example)/big", 1);
        big.digest = "x".repeat(MAX_BATCH_BYTES);
        assert!(matches!(
            batch.put_capture(&big),
            Err(Error::BatchTooLarge { .. })
        ));
    }

    #[test]
    fn test_delete_capture() {
        let (_dir, index) = open_test_index();
        let c = capture("com,example)/", 1);
        put_all(&index, &[c.clone()]);

        let mut batch = index.begin_update().unwrap();
        batch.delete_capture(&c).unwrap();
        batch.commit().unwrap();
        assert_eq!(index.estimated_record_count().unwrap(), 0);
    }

    #[test]
    fn test_iterator_holds_snapshot() {
        let (_dir, index) = open_test_index();
        put_all(&index, &[capture("com,example)/a", 1)]);

        let mut iter = index.captures_after("").unwrap();
        // committed after the iterator opened: must stay invisible
        put_all(&index, &[capture("com,example)/b", 1)]);

        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.urlkey, "com,example)/a");
        assert!(iter.next().is_none(), "snapshot must not see later writes");

        // a fresh iterator sees both
        assert_eq!(index.captures_after("").unwrap().count(), 2);
    }

    #[test]
    fn test_reverse_scan() {
        let (_dir, index) = open_test_index();
        put_all(
            &index,
            &[
                capture("com,example)/a", 1),
                capture("com,example)/b", 1),
                capture("com,example)/c", 1),
            ],
        );

        let keys: Vec<String> = index
            .captures_after_reverse("com,example)/b")
            .unwrap()
            .map(|c| c.unwrap().urlkey)
            .collect();
        assert_eq!(keys, vec!["com,example)/b", "com,example)/a"]);
    }

    #[test]
    fn test_alias_resolution_and_invalidation() {
        let (_dir, index) = open_test_index();
        let mut batch = index.begin_update().unwrap();
        batch.put_alias("com,example,www)/", "com,example)/").unwrap();
        batch.commit().unwrap();

        assert_eq!(
            index.resolve_alias("com,example,www)/").unwrap().as_deref(),
            Some("com,example)/")
        );
        // cache must not outlive the record
        let mut batch = index.begin_update().unwrap();
        batch.delete_alias("com,example,www)/").unwrap();
        batch.commit().unwrap();
        assert_eq!(index.resolve_alias("com,example,www)/").unwrap(), None);
    }

    #[test]
    fn test_list_aliases_prefix_bounded() {
        let (_dir, index) = open_test_index();
        let mut batch = index.begin_update().unwrap();
        batch.put_alias("com,example,a)/", "com,example)/").unwrap();
        batch.put_alias("com,example,b)/", "com,example)/").unwrap();
        batch.put_alias("org,example)/", "com,example)/").unwrap();
        batch.commit().unwrap();

        let aliases: Vec<Alias> = index
            .list_aliases("com,")
            .unwrap()
            .map(|a| a.unwrap())
            .collect();
        assert_eq!(aliases.len(), 2);
        assert!(aliases.iter().all(|a| a.alias.starts_with("com,")));
    }

    #[test]
    fn test_apply_raw_batch_replicates() {
        let (_dir, primary) = open_test_index();
        let dir2 = tempfile::TempDir::new().unwrap();
        let secondary = Index::open("test", &dir2.path().join("s.db"), false).unwrap();

        put_all(&primary, &[capture("com,example)/a", 1), capture("com,example)/b", 2)]);

        let mut cursor = primary.get_updates_since(SeqNo::ZERO).unwrap();
        while let Some(entry) = cursor.next() {
            let entry = entry.unwrap();
            secondary.apply_raw_batch(entry.seq, &entry.batch).unwrap();
        }

        assert_eq!(
            secondary.latest_sequence_number().unwrap(),
            primary.latest_sequence_number().unwrap()
        );
        let replicated: Vec<String> = secondary
            .captures_after("")
            .unwrap()
            .map(|c| c.unwrap().urlkey)
            .collect();
        assert_eq!(replicated, vec!["com,example)/a", "com,example)/b"]);
    }

    #[test]
    fn test_apply_raw_batch_is_idempotent() {
        let (_dir, primary) = open_test_index();
        let dir2 = tempfile::TempDir::new().unwrap();
        let secondary = Index::open("test", &dir2.path().join("s.db"), false).unwrap();

        put_all(&primary, &[capture("a", 1)]);
        let entries: Vec<_> = primary
            .get_updates_since(SeqNo::ZERO)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        for entry in &entries {
            secondary.apply_raw_batch(entry.seq, &entry.batch).unwrap();
            secondary.apply_raw_batch(entry.seq, &entry.batch).unwrap();
        }
        assert_eq!(secondary.estimated_record_count().unwrap(), 1);
    }

    #[test]
    fn test_read_only_index_refuses_writes() {
        let dir = tempfile::TempDir::new().unwrap();
        let index = Index::open("test", &dir.path().join("ro.db"), false).unwrap();
        assert!(matches!(index.begin_update(), Err(Error::Forbidden(_))));
    }

    #[test]
    fn test_flush_wal_truncates_feed() {
        let (_dir, index) = open_test_index();
        put_all(&index, &[capture("a", 1)]);
        put_all(&index, &[capture("b", 1)]);

        index.flush_wal().unwrap();
        assert!(matches!(
            index.get_updates_since(SeqNo::ZERO),
            Err(Error::SequenceTruncated { .. })
        ));
        // resuming from the latest sequence is still fine
        let latest = index.latest_sequence_number().unwrap();
        assert_eq!(index.get_updates_since(latest).unwrap().count(), 0);
    }

    #[test]
    fn test_compact_scheduling_flag() {
        let (_dir, index) = open_test_index();
        assert!(index.compact_in_background());
        // second request while (possibly) still running either schedules or
        // reports busy; once finished it must schedule again
        while index.compacting.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        assert!(index.compact_in_background());
        while index.compacting.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
    }

    #[test]
    fn test_stats_surface() {
        let (_dir, index) = open_test_index();
        put_all(&index, &[capture("a", 1)]);
        let stats = index.stats(&["page_count", "no;such;pragma"]).unwrap();
        assert_eq!(stats["estimatedRecordCount"], 1);
        assert!(stats["page_count"].is_number());
        assert!(stats["no;such;pragma"].as_str().unwrap().starts_with("ERROR"));
    }
}
