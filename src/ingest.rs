//! # Bulk CDX Ingest & Delete
//!
//! The write path for CDX text: one batch per request body, committed
//! atomically at the end. The line grammar:
//!
//! - lines starting with ` CDX` are headers, skipped
//! - `@alias <alias_url> <target_url>` installs an alias (both URLs are
//!   canonicalized)
//! - anything else is a space-separated capture record
//!
//! On ingest, bad lines either abort the whole batch (`BadLines::Error`,
//! the default — nothing is committed and the response names the line) or
//! are logged and skipped (`BadLines::Skip`).
//!
//! On delete, `recanonicalize` controls keying: re-key through the
//! canonicalizer (the default), or take the line's first two tokens as
//! `urlkey` and `timestamp` verbatim for records written by an older
//! canonicalizer configuration.

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::index::Index;
use crate::records::Capture;
use crate::surt::Canonicalizer;

/// Policy for lines that fail to parse during ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BadLines {
    /// Abort the batch, reporting the offending line.
    #[default]
    Error,
    /// Log the line and continue.
    Skip,
}

/// Outcome of a bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestReport {
    /// Records and aliases staged and committed.
    pub added: u64,
    /// Lines dropped under [`BadLines::Skip`].
    pub skipped: u64,
}

/// Outcome of a bulk delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteReport {
    pub deleted: u64,
}

/// Loads CDX text into the collection as one atomic batch.
pub fn load_cdx(
    index: &Index,
    canonicalizer: &Canonicalizer,
    body: &str,
    bad_lines: BadLines,
) -> Result<IngestReport> {
    let mut batch = index.begin_update()?;
    let mut report = IngestReport::default();

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(" CDX") {
            continue;
        }

        if let Some(rest) = line.strip_prefix("@alias ") {
            // alias lines are never subject to badLines=skip: a broken alias
            // mapping is always worth stopping for
            let mut parts = rest.split_ascii_whitespace();
            let (alias_url, target_url) = match (parts.next(), parts.next()) {
                (Some(a), Some(t)) => (a, t),
                _ => {
                    return Err(Error::bad_request(format!("at line: {line}")));
                }
            };
            let alias_surt = canonicalizer
                .surt(alias_url)
                .map_err(|e| Error::bad_request(format!("at line: {line}\n{e}")))?;
            let target_surt = canonicalizer
                .surt(target_url)
                .map_err(|e| Error::bad_request(format!("at line: {line}\n{e}")))?;
            batch.put_alias(&alias_surt, &target_surt)?;
            report.added += 1;
            continue;
        }

        match Capture::from_cdx_line(line, canonicalizer) {
            Ok(capture) => {
                batch.put_capture(&capture)?;
                report.added += 1;
            }
            Err(e) => match bad_lines {
                BadLines::Skip => {
                    warn!(error = %e, "skipping bad cdx line: {line}");
                    report.skipped += 1;
                }
                BadLines::Error => {
                    return Err(Error::bad_request(format!("at line: {line}\n{e}")));
                }
            },
        }
    }

    let seq = batch.commit()?;
    debug!(
        collection = index.name(),
        added = report.added,
        skipped = report.skipped,
        seq = %seq,
        "cdx ingest committed"
    );
    Ok(report)
}

/// Deletes the records named by CDX text as one atomic batch.
///
/// With `recanonicalize` false, the line's own `urlkey` and `timestamp`
/// tokens key the delete; the remaining fields still locate the WARC record
/// so the full primary key matches.
pub fn delete_cdx(
    index: &Index,
    canonicalizer: &Canonicalizer,
    body: &str,
    recanonicalize: bool,
) -> Result<DeleteReport> {
    let mut batch = index.begin_update()?;
    let mut report = DeleteReport::default();

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(" CDX") {
            continue;
        }

        if let Some(rest) = line.strip_prefix("@alias ") {
            let alias_url = rest
                .split_ascii_whitespace()
                .next()
                .ok_or_else(|| Error::bad_request(format!("at line: {line}")))?;
            let alias_surt = canonicalizer
                .surt(alias_url)
                .map_err(|e| Error::bad_request(format!("at line: {line}\n{e}")))?;
            batch.delete_alias(&alias_surt)?;
            report.deleted += 1;
            continue;
        }

        let capture = if recanonicalize {
            Capture::from_cdx_line(line, canonicalizer)
        } else {
            Capture::from_cdx_line_prekeyed(line)
        }
        .map_err(|e| Error::bad_request(format!("at line: {line}\n{e}")))?;

        batch.delete_capture(&capture)?;
        report.deleted += 1;
    }

    batch.commit()?;
    Ok(report)
}

// =============================================================================
// Tests
// =============================================================================
