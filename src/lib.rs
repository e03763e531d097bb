//! # cdxdb - Capture Index Core
//!
//! cdxdb is the storage and query core of a capture index server for web
//! archives: it stores billions of small records describing archived HTTP
//! captures (one per crawl response, referencing a WARC file and offset) and
//! answers high-throughput lookups by URL. It provides:
//!
//! - **SURT keying**: canonicalization that makes byte-range scans equal to
//!   semantic URL matching (exact, prefix, host, domain)
//! - **An ordered index**: packed binary records over SQLite, snapshot scan
//!   iterators, atomic write batches under monotonic sequence numbers
//! - **Query execution**: match types, regex filters, collapse, closest-in-
//!   time merging, CDX/JSON output
//! - **Access control**: prefix-matched rules, time windows, per-access-point
//!   policy decisions
//! - **Replication**: a change feed of opaque write batches that secondaries
//!   tail and apply
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     HTTP Layer (out of scope)                   │
//! └───────────────┬────────────────────────────────┬────────────────┘
//!                 │ queries                        │ writes
//!                 ▼                                ▼
//! ┌───────────────────────────┐    ┌───────────────────────────────┐
//! │       QueryExecutor       │    │      ingest / Batch API       │
//! │  surt → bounds → pipeline │    │  CDX lines → ops → commit     │
//! └───────────────┬───────────┘    └───────────────┬───────────────┘
//!                 │                                │
//!                 ▼                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   DataStore ── Index (per collection) ── AccessControl          │
//! │        records (ordered KV)  +  changelog (shipped write log)   │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//!                       ┌──────────────┐      changes?since=N
//!                       │ SQLite (WAL) │  ───────────────────▶ secondaries
//!                       └──────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Byte order is semantic order**: encoded capture keys sort exactly by
//!    `(urlkey, timestamp, filename, offset)`
//! 2. **One sequence number per batch**: strictly increasing, never reused,
//!    gaps only from log truncation
//! 3. **Snapshots**: an open iterator never observes a concurrent commit
//! 4. **Batches are all-or-nothing**: a dropped batch leaves no trace
//! 5. **Aliases resolve one hop**: targets are never chased transitively

pub mod access;
pub mod codec;
pub mod config;
pub mod error;
pub mod feed;
pub mod index;
pub mod ingest;
pub mod query;
pub mod records;
pub mod schema;
pub mod store;
pub mod surt;

pub use access::{AccessDecision, AccessPolicy, AccessRule, Period, RuleSort, RuleStamp};
pub use config::{CanonConfig, Config};
pub use error::{Error, Result, RuleViolation};
pub use feed::{parse_change_feed, render_change_feed, ChangeCursor, ChangeEntry, DEFAULT_FEED_SIZE};
pub use index::{AliasIter, Batch, CaptureIter, Index, MAX_BATCH_BYTES};
pub use ingest::{delete_cdx, load_cdx, BadLines, DeleteReport, IngestReport};
pub use query::{
    render, render_cdx, render_json, render_xml, FilterPlugin, MatchType, OutputFormat, ParamMap,
    Query, QueryExecutor, QueryOutcome, Sort,
};
pub use records::{Alias, Capture, SeqNo};
pub use store::DataStore;
pub use surt::{surt_to_url, Canonicalizer};
