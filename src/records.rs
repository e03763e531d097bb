//! # Domain Types for cdxdb
//!
//! This module defines the records the index stores and the identifiers used
//! around them: captures, aliases, sequence numbers, and the 14-digit
//! timestamp format shared by all of them.
//!
//! ## Invariants
//!
//! - [`SeqNo`]: strictly increasing per collection, assigned at batch commit,
//!   never reused (gaps may appear after log truncation, never reordering)
//! - [`Capture::timestamp`]: within `[0, 99_999_999_999_999]`
//! - `Capture::urlkey` is the canonicalization of `Capture::original_url`
//!   unless the client explicitly supplied a pre-keyed record

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::surt::Canonicalizer;

// =============================================================================
// Timestamps
// =============================================================================

/// Smallest representable capture timestamp.
pub const MIN_TIMESTAMP: u64 = 0;

/// Largest representable capture timestamp (`99991231235959` would be the
/// largest calendar value, but the field is bounded as 14 digits).
pub const MAX_TIMESTAMP: u64 = 99_999_999_999_999;

/// Pads a timestamp string to 14 digits with `pad_digit`, or truncates it to
/// 14 digits, then parses it.
///
/// `"2019"` pads to `20190000000000` (with `'0'`) or `20199999999999` (with
/// `'9'`); `"20190128123456789"` truncates to `20190128123456`.
pub fn timestamp14(timestamp: &str, pad_digit: char) -> Result<u64> {
    let mut buf: String = timestamp.chars().take(14).collect();
    while buf.len() < 14 {
        buf.push(pad_digit);
    }
    buf.parse::<u64>()
        .map_err(|_| Error::bad_request(format!("invalid timestamp: {timestamp}")))
}

/// Validates that a timestamp fits the 14-digit field.
pub fn validate_timestamp(timestamp: u64) -> Result<u64> {
    if timestamp > MAX_TIMESTAMP {
        return Err(Error::bad_request(format!(
            "timestamp out of range: {timestamp}"
        )));
    }
    Ok(timestamp)
}

/// Converts a Unix timestamp in milliseconds to `YYYYMMDDhhmmss` (UTC).
///
/// Used for access-time rule evaluation and audit stamps.
pub fn ts14_from_unix_ms(unix_ms: u64) -> u64 {
    let secs = (unix_ms / 1000) as i64;
    let days = secs.div_euclid(86_400);
    let tod = secs.rem_euclid(86_400);

    // Days-to-civil conversion over the proleptic Gregorian calendar.
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe as i64 + era * 400 + if month <= 2 { 1 } else { 0 };

    let (hour, minute, second) = (tod / 3600, (tod % 3600) / 60, tod % 60);
    (year as u64) * 10_000_000_000
        + month * 100_000_000
        + day * 1_000_000
        + (hour as u64) * 10_000
        + (minute as u64) * 100
        + second as u64
}

/// The current wall-clock time as a 14-digit UTC timestamp.
pub fn now_ts14() -> u64 {
    ts14_from_unix_ms(current_time_ms())
}

/// Returns the current time in milliseconds since the Unix epoch.
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// Sequence Numbers
// =============================================================================

/// The sequence number of a committed write batch.
///
/// One `SeqNo` is assigned per batch, not per record, and doubles as the
/// replication cursor: a secondary that has applied everything up to `n`
/// resumes with `get_updates_since(n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeqNo(u64);

impl SeqNo {
    /// The position before any batch has committed. `get_updates_since(ZERO)`
    /// replays the whole retained log.
    pub const ZERO: SeqNo = SeqNo(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Captures
// =============================================================================

/// One archived HTTP response: where it lives inside a WARC container and
/// what the crawler observed about it.
///
/// # Primary Key
///
/// `(urlkey, timestamp, filename, offset)`. Re-putting the same tuple is an
/// idempotent upsert; the same `(urlkey, timestamp)` may appear in several
/// WARC files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capture {
    /// SURT form of the URL; the primary sort key.
    pub urlkey: String,
    /// Capture time as `YYYYMMDDhhmmss`.
    pub timestamp: u64,
    /// The URL before canonicalization.
    #[serde(rename = "original")]
    pub original_url: String,
    /// Reported MIME type (`-` when unknown).
    pub mimetype: String,
    /// HTTP status code (0 renders as `-`).
    pub status: u16,
    /// Content digest (typically `sha1:` base32).
    pub digest: String,
    /// Redirect target, or `-`.
    pub redirecturl: String,
    /// Robots.txt flags, or `-`.
    pub robotflags: String,
    /// Compressed record length inside the WARC.
    pub length: u64,
    /// Byte offset of the record inside the WARC.
    pub offset: u64,
    /// WARC file name.
    pub filename: String,
    /// Locator of the unrewritten variant, when one exists (CDX14 schema).
    #[serde(rename = "originalLength", skip_serializing_if = "Option::is_none")]
    pub original_length: Option<u64>,
    #[serde(rename = "originalOffset", skip_serializing_if = "Option::is_none")]
    pub original_offset: Option<u64>,
    #[serde(rename = "originalFilename", skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
}

impl Default for Capture {
    fn default() -> Self {
        Self {
            urlkey: String::new(),
            timestamp: 0,
            original_url: String::new(),
            mimetype: "-".to_string(),
            status: 0,
            digest: "-".to_string(),
            redirecturl: "-".to_string(),
            robotflags: "-".to_string(),
            length: 0,
            offset: 0,
            filename: String::new(),
            original_length: None,
            original_offset: None,
            original_filename: None,
        }
    }
}

impl Capture {
    /// Parses a space-separated CDX line (11 or 14 fields), re-keying the
    /// record through `canonicalizer`.
    ///
    /// The stored `urlkey` comes from canonicalizing the original URL field,
    /// not from the line's first token, so records indexed under an older
    /// canonicalizer are healed on re-ingest.
    pub fn from_cdx_line(line: &str, canonicalizer: &Canonicalizer) -> Result<Capture> {
        let mut capture = Self::from_cdx_line_prekeyed(line)?;
        capture.urlkey = canonicalizer.surt(&capture.original_url)?;
        Ok(capture)
    }

    /// Parses a space-separated CDX line taking the first token as `urlkey`
    /// verbatim.
    ///
    /// Used when the client supplied pre-keyed records; a key produced by a
    /// different canonicalizer configuration may silently miss records.
    pub fn from_cdx_line_prekeyed(line: &str) -> Result<Capture> {
        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        if fields.len() != 11 && fields.len() != 14 {
            return Err(Error::bad_request(format!(
                "expected 11 or 14 CDX fields, found {}: {line}",
                fields.len()
            )));
        }

        let capture = Capture {
            urlkey: fields[0].to_string(),
            timestamp: validate_timestamp(timestamp14(fields[1], '0')?)?,
            original_url: fields[2].to_string(),
            mimetype: fields[3].to_string(),
            status: parse_numeric_or_dash(fields[4], line)? as u16,
            digest: fields[5].to_string(),
            redirecturl: fields[6].to_string(),
            robotflags: fields[7].to_string(),
            length: parse_numeric_or_dash(fields[8], line)?,
            offset: parse_numeric_or_dash(fields[9], line)?,
            filename: fields[10].to_string(),
            original_length: if fields.len() == 14 {
                parse_optional_numeric(fields[11], line)?
            } else {
                None
            },
            original_offset: if fields.len() == 14 {
                parse_optional_numeric(fields[12], line)?
            } else {
                None
            },
            original_filename: if fields.len() == 14 && fields[13] != "-" {
                Some(fields[13].to_string())
            } else {
                None
            },
        };
        Ok(capture)
    }

    /// Renders the named field as CDX text, `-` standing in for anything
    /// absent or zero-valued.
    ///
    /// Recognizes the wayback field names used in `fl=` and `filter=`
    /// parameters (`url` and `original` both name the original URL, `mime`
    /// and `mimetype` the MIME type).
    pub fn field(&self, name: &str) -> Option<String> {
        let value = match name {
            "urlkey" => self.urlkey.clone(),
            "timestamp" => self.timestamp.to_string(),
            "url" | "original" => self.original_url.clone(),
            "mime" | "mimetype" => self.mimetype.clone(),
            "status" | "statuscode" => {
                if self.status == 0 {
                    "-".to_string()
                } else {
                    self.status.to_string()
                }
            }
            "digest" => self.digest.clone(),
            "redirecturl" | "redirect" => self.redirecturl.clone(),
            "robotflags" => self.robotflags.clone(),
            "length" => self.length.to_string(),
            "offset" => self.offset.to_string(),
            "filename" => self.filename.clone(),
            "originalLength" => self
                .original_length
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string()),
            "originalOffset" => self
                .original_offset
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string()),
            "originalFilename" => self
                .original_filename
                .clone()
                .unwrap_or_else(|| "-".to_string()),
            _ => return None,
        };
        Some(value)
    }

    /// Renders this capture as a CDX text line with the given fields.
    pub fn to_cdx_line(&self, fields: &[&str]) -> String {
        fields
            .iter()
            .map(|f| {
                let v = self.field(f).unwrap_or_else(|| "-".to_string());
                if v.is_empty() {
                    "-".to_string()
                } else {
                    v
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn parse_numeric_or_dash(field: &str, line: &str) -> Result<u64> {
    if field == "-" {
        return Ok(0);
    }
    field
        .parse::<u64>()
        .map_err(|_| Error::bad_request(format!("invalid numeric field '{field}' in: {line}")))
}

fn parse_optional_numeric(field: &str, line: &str) -> Result<Option<u64>> {
    if field == "-" {
        return Ok(None);
    }
    Ok(Some(parse_numeric_or_dash(field, line)?))
}

// =============================================================================
// Aliases
// =============================================================================

/// A redirect mapping between two SURT keys.
///
/// Lookups resolve through at most one hop; targets that are themselves
/// aliased are not chased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    /// The key clients query with.
    pub alias: String,
    /// The key the captures actually live under.
    pub target: String,
}

impl Alias {
    pub fn new(alias: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            target: target.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
