//! # Change Feed
//!
//! Secondaries replicate by tailing a primary's changelog: an ordered stream
//! of `(sequence number, opaque write-batch blob)` pairs. The blobs are the
//! codec's own batch serialization; applying them through
//! [`Index::apply_raw_batch`](crate::index::Index::apply_raw_batch) replays
//! the primary's commits in order. Cross-engine replication is not a thing:
//! only cdxdb nodes understand the blobs.
//!
//! ## Wire Format
//!
//! The feed page is a JSON array, sequence numbers as decimal strings and
//! batches base64-encoded:
//!
//! ```text
//! [
//!   {"sequenceNumber": "12", "writeBatch": "AQAAAA…"},
//!   {"sequenceNumber": "13", "writeBatch": "AQAAAA…"}
//! ]
//! ```
//!
//! A page ends once cumulative base64 size reaches the requested budget,
//! but always carries at least one entry when any exists. That guarantees
//! forward progress even for a single batch larger than the budget.
//!
//! ## Cursor Discipline
//!
//! A [`ChangeCursor`] owns its read-only connection and snapshot, ends at
//! the changelog tail as of open, and releases everything on drop — the
//! streaming response takes ownership of the cursor and drops it when the
//! response completes.

use std::collections::VecDeque;

use base64::Engine as _;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::index::read_latest_seq;
use crate::records::SeqNo;

/// Default page budget for feed responses: 10 MiB of base64.
pub const DEFAULT_FEED_SIZE: u64 = 10 * 1024 * 1024;

/// Rows fetched per chunk while tailing the changelog.
const FEED_CHUNK: usize = 64;

// =============================================================================
// Change Cursor
// =============================================================================

/// One changelog row: a committed batch and its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    pub seq: SeqNo,
    pub batch: Vec<u8>,
}

/// A finite cursor over the changelog, strictly after a starting sequence.
pub struct ChangeCursor {
    conn: Connection,
    after: u64,
    buffer: VecDeque<ChangeEntry>,
    exhausted: bool,
}

impl std::fmt::Debug for ChangeCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeCursor")
            .field("after", &self.after)
            .field("buffer", &self.buffer)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl ChangeCursor {
    /// Opens a cursor over entries with `seq > since`.
    ///
    /// # Errors
    ///
    /// [`Error::SequenceTruncated`] when `since` predates the oldest
    /// retained changelog row, meaning the gap can never be served.
    pub(crate) fn open(conn: Connection, since: SeqNo) -> Result<ChangeCursor> {
        conn.execute_batch("BEGIN")?;
        conn.query_row("SELECT count(*) FROM metadata", [], |_row| Ok(()))?;

        let oldest: Option<i64> =
            conn.query_row("SELECT min(seq) FROM changelog", [], |row| row.get(0))?;

        match oldest {
            Some(oldest) => {
                // Resuming from `since` needs row `since + 1` onward.
                let oldest = oldest as u64;
                if since.as_raw() + 1 < oldest {
                    return Err(Error::SequenceTruncated {
                        requested: since.as_raw(),
                        oldest,
                    });
                }
            }
            None => {
                // Empty log: fine only if the caller is already caught up.
                let latest = read_latest_seq(&conn)?;
                if since < latest {
                    return Err(Error::SequenceTruncated {
                        requested: since.as_raw(),
                        oldest: latest.as_raw() + 1,
                    });
                }
            }
        }

        Ok(ChangeCursor {
            conn,
            after: since.as_raw(),
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    fn fetch_chunk(&mut self) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT seq, batch FROM changelog WHERE seq > ? ORDER BY seq LIMIT ?",
        )?;
        let rows = stmt.query_map(params![self.after as i64, FEED_CHUNK as i64], |row| {
            Ok(ChangeEntry {
                seq: SeqNo::from_raw(row.get::<_, i64>(0)? as u64),
                batch: row.get(1)?,
            })
        })?;
        let entries = rows.collect::<std::result::Result<Vec<_>, _>>()?;

        if entries.len() < FEED_CHUNK {
            self.exhausted = true;
        }
        if let Some(last) = entries.last() {
            self.after = last.seq.as_raw();
        }
        self.buffer.extend(entries);
        Ok(())
    }
}

impl Iterator for ChangeCursor {
    type Item = Result<ChangeEntry>;

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

impl Drop for ChangeCursor {
    fn drop(&mut self) {
        let _ = self.conn.execute_batch("ROLLBACK");
    }
}

// =============================================================================
// Wire Format
// =============================================================================

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEntry {
    sequence_number: String,
    write_batch: String,
}

/// Renders one feed page from the cursor.
///
/// Entries are drawn until cumulative base64 size reaches `size_budget`,
/// with at least one entry emitted when the cursor has any; a zero or tiny
/// budget still makes progress.
pub fn render_change_feed(cursor: &mut ChangeCursor, size_budget: u64) -> Result<String> {
    let mut entries: Vec<WireEntry> = Vec::new();
    let mut size = 0u64;

    for entry in cursor.by_ref() {
        let entry = entry?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&entry.batch);
        size += encoded.len() as u64;
        entries.push(WireEntry {
            sequence_number: entry.seq.to_string(),
            write_batch: encoded,
        });
        if size >= size_budget {
            break;
        }
    }

    serde_json::to_string(&entries).map_err(|e| Error::Internal(format!("feed encoding: {e}")))
}

/// Parses a feed page back into `(sequence, batch)` pairs.
///
/// This is what a secondary's poll loop feeds into `apply_raw_batch`,
/// checkpointing the last sequence number only after every batch applied.
pub fn parse_change_feed(body: &str) -> Result<Vec<ChangeEntry>> {
    let entries: Vec<WireEntry> = serde_json::from_str(body)
        .map_err(|e| Error::bad_request(format!("malformed change feed: {e}")))?;
    entries
        .into_iter()
        .map(|entry| {
            let seq = entry
                .sequence_number
                .parse::<u64>()
                .map_err(|_| Error::bad_request(format!("bad sequence number: {}", entry.sequence_number)))?;
            let batch = base64::engine::general_purpose::STANDARD
                .decode(entry.write_batch.as_bytes())
                .map_err(|e| Error::bad_request(format!("bad batch encoding: {e}")))?;
            Ok(ChangeEntry {
                seq: SeqNo::from_raw(seq),
                batch,
            })
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;
    use crate::records::Capture;

    fn open_index_with_batches(n: usize) -> (tempfile::TempDir, Index) {
        let dir = tempfile::TempDir::new().unwrap();
        let index = Index::open("feed", &dir.path().join("feed.db"), true).unwrap();
        for i in 0..n {
            let mut batch = index.begin_update().unwrap();
            batch
                .put_capture(&Capture {
                    urlkey: format!("com,example)/{i}"),
                    timestamp: 20200101000000 + i as u64,
                    original_url: format!("http://example.com/{i}"),
                    filename: "w.warc.gz".to_string(),
                    ..Capture::default()
                })
                .unwrap();
            batch.commit().unwrap();
        }
        (dir, index)
    }

    #[test]
    fn test_cursor_yields_batches_in_order() {
        let (_dir, index) = open_index_with_batches(5);
        let seqs: Vec<u64> = index
            .get_updates_since(SeqNo::ZERO)
            .unwrap()
            .map(|e| e.unwrap().seq.as_raw())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_cursor_resumes_after_checkpoint() {
        let (_dir, index) = open_index_with_batches(5);
        let seqs: Vec<u64> = index
            .get_updates_since(SeqNo::from_raw(3))
            .unwrap()
            .map(|e| e.unwrap().seq.as_raw())
            .collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn test_cursor_is_finite_at_tail() {
        let (_dir, index) = open_index_with_batches(2);
        let latest = index.latest_sequence_number().unwrap();
        assert_eq!(index.get_updates_since(latest).unwrap().count(), 0);
    }

    #[test]
    fn test_wire_roundtrip() {
        let (_dir, index) = open_index_with_batches(3);
        let mut cursor = index.get_updates_since(SeqNo::ZERO).unwrap();
        let body = render_change_feed(&mut cursor, DEFAULT_FEED_SIZE).unwrap();

        let parsed = parse_change_feed(&body).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].seq, SeqNo::from_raw(1));

        // blobs survive the base64 hop intact
        let direct: Vec<ChangeEntry> = index
            .get_updates_since(SeqNo::ZERO)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(parsed, direct);
    }

    #[test]
    fn test_budget_still_emits_first_entry() {
        let (_dir, index) = open_index_with_batches(3);
        let mut cursor = index.get_updates_since(SeqNo::ZERO).unwrap();
        // budget far below one entry's size: exactly one entry must come out
        let body = render_change_feed(&mut cursor, 1).unwrap();
        assert_eq!(parse_change_feed(&body).unwrap().len(), 1);

        // the rest is still available on the same cursor
        let rest = render_change_feed(&mut cursor, DEFAULT_FEED_SIZE).unwrap();
        assert_eq!(parse_change_feed(&rest).unwrap().len(), 2);
    }

    #[test]
    fn test_empty_feed_renders_empty_array() {
        let (_dir, index) = open_index_with_batches(0);
        let mut cursor = index.get_updates_since(SeqNo::ZERO).unwrap();
        let body = render_change_feed(&mut cursor, DEFAULT_FEED_SIZE).unwrap();
        assert_eq!(body, "[]");
    }

    #[test]
    fn test_truncated_sequence_reported() {
        let (_dir, index) = open_index_with_batches(4);
        index.flush_wal().unwrap();
        // one more commit so the log is non-empty but starts past `since`
        let mut batch = index.begin_update().unwrap();
        batch
            .put_capture(&Capture {
                urlkey: "com,example)/fresh".to_string(),
                timestamp: 1,
                original_url: "http://example.com/fresh".to_string(),
                filename: "w.warc.gz".to_string(),
                ..Capture::default()
            })
            .unwrap();
        batch.commit().unwrap();

        match index.get_updates_since(SeqNo::ZERO) {
            Err(Error::SequenceTruncated { requested: 0, oldest: 5 }) => {}
            other => panic!("expected SequenceTruncated, got {other:?}"),
        }
        // resuming exactly at the gap edge works
        assert_eq!(index.get_updates_since(SeqNo::from_raw(4)).unwrap().count(), 1);
    }
}
