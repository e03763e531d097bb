//! # Error Handling for cdxdb
//!
//! This module defines the error types used throughout cdxdb. We use a single
//! error enum ([`Error`]) to represent all failure modes, which keeps function
//! signatures simple and lets callers match uniformly.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Client | bad parameter, invalid URL, unknown collection | 4xx, fix the request |
//! | Validation | rule references missing policy, inverted period | 409 with violation list |
//! | Replication | requested sequence already pruned from the log | full resync |
//! | Storage | SQLite error, corrupt record, unknown codec version | log and investigate |
//!
//! Parse and validation errors carry a human-readable message including the
//! offending parameter or line, so the transport layer can surface them
//! verbatim.

use thiserror::Error;

// =============================================================================
// Rule Violations
// =============================================================================

/// A single validation failure for an access rule or policy.
///
/// Rule validation reports *all* violations rather than stopping at the
/// first, so a client can fix a submitted rule in one round trip.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RuleViolation {
    /// The field the violation applies to (e.g. `"surts"`, `"period"`).
    pub field: String,
    /// Human-readable description of the problem.
    pub message: String,
}

impl RuleViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in cdxdb operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or conflicting request parameters.
    ///
    /// The message names the offending parameter or input line so the
    /// transport layer can return it to the client unchanged.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A URL could not be canonicalized.
    ///
    /// Raised for non-absolute input and invalid percent-encoding. Surfaced
    /// to clients as a bad request, but kept as its own variant so ingest
    /// code can report which line carried the bad URL.
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl {
        /// The URL as received.
        url: String,
        /// What made it unacceptable.
        reason: String,
    },

    /// A collection, rule, or policy does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A write was attempted on a node that does not accept writes.
    ///
    /// Returned by every mutating operation when the node is configured as a
    /// secondary replica without `accept_writes`.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// An access rule or policy failed validation.
    ///
    /// Carries every violation found, not just the first.
    #[error("validation failed: {}", format_violations(.0))]
    RuleInvalid(Vec<RuleViolation>),

    /// The change feed was asked for a sequence number that has already been
    /// pruned from the replication log.
    ///
    /// # Recovery
    ///
    /// The secondary cannot catch up incrementally and must resync from a
    /// fresh copy of the collection.
    #[error("sequence {requested} predates the oldest retained log entry {oldest}")]
    SequenceTruncated {
        /// The sequence number the caller asked to resume from.
        requested: u64,
        /// The oldest sequence number still present in the log.
        oldest: u64,
    },

    /// A stored value carries a codec version this build does not know.
    ///
    /// Happens when a newer node wrote records that an older node then tries
    /// to read. The record is left untouched; the reader must be upgraded.
    #[error("unknown record version {version}")]
    UnknownRecordVersion {
        /// The version byte found in the stored value.
        version: u8,
    },

    /// A write batch exceeded the engine's staging limit.
    ///
    /// The batch is unusable; the caller should split the input and retry
    /// with smaller batches.
    #[error("write batch of {size} bytes exceeds the {max} byte limit")]
    BatchTooLarge {
        /// Staged size at the point the limit was hit.
        size: usize,
        /// The configured limit.
        max: usize,
    },

    /// A stored record or replication blob failed integrity checks.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// SQLite operation failed.
    ///
    /// Wraps any error from the `rusqlite` crate: locked database files,
    /// full disks, corruption, or a SQL bug in cdxdb itself.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Everything else.
    #[error("internal error: {0}")]
    Internal(String),
}

fn format_violations(violations: &[RuleViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Convenience constructor for [`Error::BadRequest`].
    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::BadRequest(message.into())
    }

    /// True if this error is the client's fault rather than the server's.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::BadRequest(_)
                | Error::InvalidUrl { .. }
                | Error::NotFound(_)
                | Error::Forbidden(_)
                | Error::RuleInvalid(_)
        )
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages appear in logs and client responses; make sure they
    /// carry the relevant details.
    #[test]
    fn test_error_display() {
        let truncated = Error::SequenceTruncated {
            requested: 3,
            oldest: 17,
        };
        assert_eq!(
            truncated.to_string(),
            "sequence 3 predates the oldest retained log entry 17"
        );

        let unknown = Error::UnknownRecordVersion { version: 9 };
        assert_eq!(unknown.to_string(), "unknown record version 9");

        let invalid = Error::InvalidUrl {
            url: "not a url".to_string(),
            reason: "missing scheme".to_string(),
        };
        assert_eq!(invalid.to_string(), "invalid url 'not a url': missing scheme");
    }

    #[test]
    fn test_rule_invalid_lists_every_violation() {
        let err = Error::RuleInvalid(vec![
            RuleViolation::new("surts", "empty prefix"),
            RuleViolation::new("policy_id", "no such policy: 42"),
        ]);
        let text = err.to_string();
        assert!(text.contains("surts: empty prefix"));
        assert!(text.contains("policy_id: no such policy: 42"));
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();
        assert!(matches!(our_err, Error::Storage(_)));
        assert!(our_err.to_string().contains("storage error"));
    }

    #[test]
    fn test_client_error_classification() {
        assert!(Error::bad_request("nope").is_client_error());
        assert!(Error::NotFound("coll".into()).is_client_error());
        assert!(!Error::Internal("boom".into()).is_client_error());
        assert!(!Error::SequenceTruncated { requested: 0, oldest: 1 }.is_client_error());
    }
}
