//! # Configuration
//!
//! One immutable [`Config`] value is built at startup and threaded through
//! constructors; nothing in the crate consults process-wide mutable state.
//!
//! ## Resolution Order
//!
//! Settings resolve from four sources, later sources overriding earlier ones:
//!
//! 1. built-in defaults ([`Config::default`])
//! 2. environment variables (`CDXDB_*`)
//! 3. a JSON config file, if one is supplied
//! 4. explicit field assignment by the embedding application
//!
//! Changing any [`CanonConfig`] knob changes the keys the canonicalizer
//! produces, which invalidates every key already stored under the old
//! configuration. Treat such a change as a full reindex, not a restart.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

// =============================================================================
// Canonicalizer Options
// =============================================================================

/// Options controlling SURT key generation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CanonConfig {
    /// Strip a leading `www.` (and `www2.`, `www3.`, …) host label.
    pub strip_www: bool,

    /// Lowercase the URL path in addition to scheme and host.
    pub lowercase_path: bool,

    /// Strip well-known session identifiers (`jsessionid` path parameters,
    /// `phpsessid`/`sid`/`aspsessionid*` query parameters).
    pub strip_session_ids: bool,

    /// Query parameter names dropped entirely during canonicalization.
    ///
    /// Matched case-insensitively against the decoded parameter name.
    pub tracking_param_blocklist: BTreeSet<String>,
}

impl Default for CanonConfig {
    fn default() -> Self {
        Self {
            strip_www: true,
            lowercase_path: true,
            strip_session_ids: true,
            tracking_param_blocklist: ["utm_source", "utm_medium", "utm_campaign", "utm_term", "utm_content", "fbclid", "gclid"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Top-level configuration for a cdxdb node.
///
/// The `port`/`bind` fields are carried for the embedding HTTP layer; the
/// library itself only reads the storage and query knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding one SQLite database per collection.
    pub data_dir: PathBuf,

    /// TCP port for the embedding HTTP layer.
    pub port: u16,

    /// Bind address for the embedding HTTP layer.
    pub bind: String,

    /// Log request/ingest lines at debug level.
    pub verbose: bool,

    /// Enable the three `original_*` locator fields (the CDX14 schema) in
    /// default field lists and new records.
    pub cdx14: bool,

    /// Enable the access-control keyspaces and decision endpoints.
    pub experimental_access_control: bool,

    /// This node tails a primary instead of accepting client writes.
    pub secondary_mode: bool,

    /// Allow writes even in secondary mode (for catch-up tooling).
    pub accept_writes: bool,

    /// Base URL for WARC fetching during identity replay (out of core; held
    /// for the replay layer).
    pub warc_base_url: Option<String>,

    /// Hard cap applied to every query's `limit`.
    pub max_num_results: u64,

    /// Wall-clock budget for query execution, in milliseconds. Exceeding it
    /// truncates the result stream. Zero disables the budget.
    pub query_timeout_ms: u64,

    /// Retry zero-result queries once with `%20`/space replaced by `+`.
    ///
    /// Workaround for a known bad-WARC dataset whose URLs were written with
    /// `+` where the crawler logged `%20`.
    pub cdx_plus_workaround: bool,

    /// Canonicalizer options.
    pub canon: CanonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            port: 8080,
            bind: "0.0.0.0".to_string(),
            verbose: false,
            cdx14: false,
            experimental_access_control: false,
            secondary_mode: false,
            accept_writes: false,
            warc_base_url: None,
            max_num_results: 10_000,
            query_timeout_ms: 0,
            cdx_plus_workaround: false,
            canon: CanonConfig::default(),
        }
    }
}

impl Config {
    /// Builds a configuration from defaults plus `CDXDB_*` environment
    /// variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Builds a configuration from defaults, environment variables, and a
    /// JSON config file, in that order (file wins over environment).
    pub fn from_env_and_file(path: &Path) -> Result<Self> {
        let mut config = Config::from_env()?;
        config.apply_file(path)?;
        Ok(config)
    }

    /// Overlays `CDXDB_*` environment variables onto this configuration.
    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_var("CDXDB_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("CDXDB_PORT") {
            self.port = v
                .parse()
                .map_err(|_| Error::bad_request(format!("CDXDB_PORT: not a port number: {v}")))?;
        }
        if let Some(v) = env_var("CDXDB_BIND") {
            self.bind = v;
        }
        if let Some(v) = env_var("CDXDB_VERBOSE") {
            self.verbose = parse_bool("CDXDB_VERBOSE", &v)?;
        }
        if let Some(v) = env_var("CDXDB_CDX14") {
            self.cdx14 = parse_bool("CDXDB_CDX14", &v)?;
        }
        if let Some(v) = env_var("CDXDB_EXPERIMENTAL_ACCESS_CONTROL") {
            self.experimental_access_control = parse_bool("CDXDB_EXPERIMENTAL_ACCESS_CONTROL", &v)?;
        }
        if let Some(v) = env_var("CDXDB_SECONDARY_MODE") {
            self.secondary_mode = parse_bool("CDXDB_SECONDARY_MODE", &v)?;
        }
        if let Some(v) = env_var("CDXDB_ACCEPT_WRITES") {
            self.accept_writes = parse_bool("CDXDB_ACCEPT_WRITES", &v)?;
        }
        if let Some(v) = env_var("CDXDB_WARC_BASE_URL") {
            self.warc_base_url = Some(v);
        }
        if let Some(v) = env_var("CDXDB_MAX_NUM_RESULTS") {
            self.max_num_results = v
                .parse()
                .map_err(|_| Error::bad_request(format!("CDXDB_MAX_NUM_RESULTS: not a number: {v}")))?;
        }
        if let Some(v) = env_var("CDXDB_QUERY_TIMEOUT_MS") {
            self.query_timeout_ms = v
                .parse()
                .map_err(|_| Error::bad_request(format!("CDXDB_QUERY_TIMEOUT_MS: not a number: {v}")))?;
        }
        if let Some(v) = env_var("CDXDB_PLUS_WORKAROUND") {
            self.cdx_plus_workaround = parse_bool("CDXDB_PLUS_WORKAROUND", &v)?;
        }
        Ok(())
    }

    /// Overlays a JSON config file onto this configuration.
    ///
    /// The file may contain any subset of the fields; absent fields keep
    /// their current values. Unknown fields are rejected so typos do not
    /// silently become no-ops.
    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::bad_request(format!("config file {}: {e}", path.display())))?;
        let overlay: ConfigOverlay = serde_json::from_str(&text)
            .map_err(|e| Error::bad_request(format!("config file {}: {e}", path.display())))?;
        overlay.apply(self);
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(Error::bad_request(format!("{name}: not a boolean: {other}"))),
    }
}

/// Partial configuration as read from a JSON file.
///
/// Every field optional, so a file only has to name what it changes.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigOverlay {
    data_dir: Option<PathBuf>,
    port: Option<u16>,
    bind: Option<String>,
    verbose: Option<bool>,
    cdx14: Option<bool>,
    experimental_access_control: Option<bool>,
    secondary_mode: Option<bool>,
    accept_writes: Option<bool>,
    warc_base_url: Option<String>,
    max_num_results: Option<u64>,
    query_timeout_ms: Option<u64>,
    cdx_plus_workaround: Option<bool>,
    canon: Option<CanonConfig>,
}

impl ConfigOverlay {
    fn apply(self, config: &mut Config) {
        if let Some(v) = self.data_dir {
            config.data_dir = v;
        }
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = self.bind {
            config.bind = v;
        }
        if let Some(v) = self.verbose {
            config.verbose = v;
        }
        if let Some(v) = self.cdx14 {
            config.cdx14 = v;
        }
        if let Some(v) = self.experimental_access_control {
            config.experimental_access_control = v;
        }
        if let Some(v) = self.secondary_mode {
            config.secondary_mode = v;
        }
        if let Some(v) = self.accept_writes {
            config.accept_writes = v;
        }
        if let Some(v) = self.warc_base_url {
            config.warc_base_url = Some(v);
        }
        if let Some(v) = self.max_num_results {
            config.max_num_results = v;
        }
        if let Some(v) = self.query_timeout_ms {
            config.query_timeout_ms = v;
        }
        if let Some(v) = self.cdx_plus_workaround {
            config.cdx_plus_workaround = v;
        }
        if let Some(v) = self.canon {
            config.canon = v;
        }
    }
}

impl Config {
    /// True when this node must refuse client writes.
    pub fn read_only(&self) -> bool {
        self.secondary_mode && !self.accept_writes
    }
}

// =============================================================================
// Tests
// =============================================================================
