//! # Query Planning & Execution
//!
//! Translates request parameters into an iterator pipeline over the index:
//!
//! ```text
//! params ──parse──▶ Query ──plan──▶ scan bounds
//!                                      │
//!   raw scan ▶ timestamp window ▶ filters ▶ omit-self-redirects
//!            ▶ access point ▶ collapse ▶ limit ▶ deadline ▶ serialize
//! ```
//!
//! Every stage is a lazy iterator adapter; nothing is buffered beyond the
//! one-capture lookahead `collapseToLast` needs. The scan at the bottom owns
//! its snapshot and connection, so handing the pipeline to a streaming
//! response transfers everything the response needs to drop when it is done.
//!
//! ## Match Types
//!
//! | matchType | scan range |
//! |-----------|------------|
//! | `EXACT`   | one urlkey (terminator-bounded prefix) |
//! | `PREFIX`  | urlkeys extending the query key |
//! | `HOST`    | one reversed host (`com,example)`) |
//! | `DOMAIN`  | a reversed domain and every subdomain (`com,example`) |
//! | `RANGE`   | `[surt(url), surt(endUrl))` |
//!
//! `matchType=DEFAULT` infers `PREFIX` from a trailing `*` and `DOMAIN` from
//! a leading `*.`, otherwise `EXACT`.
//!
//! ## Closest-in-Time
//!
//! `sort=closest` runs a forward scan and a reverse scan from the same
//! `(urlkey, closest)` anchor and merges them by `|timestamp − closest|`,
//! ties to the earlier capture.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::codec::{
    capture_key_at, capture_key_prefix, capture_key_prefix_exact, prefix_successor, NS_CAPTURE,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::{CaptureIter, Index, ScanBounds};
use crate::records::{timestamp14, now_ts14, Capture, MAX_TIMESTAMP, MIN_TIMESTAMP};
use crate::surt::{surt_to_url, Canonicalizer};

// =============================================================================
// Parameters
// =============================================================================

/// An ordered multimap of request parameters (`filter=` repeats).
#[derive(Debug, Clone, Default)]
pub struct ParamMap(Vec<(String, String)>);

impl ParamMap {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(k, _)| k == name)
    }

    fn with_replaced(&self, name: &str, value: &str) -> ParamMap {
        let mut pairs: Vec<(String, String)> = self
            .0
            .iter()
            .filter(|(k, _)| k != name)
            .cloned()
            .collect();
        pairs.push((name.to_string(), value.to_string()));
        ParamMap(pairs)
    }
}

// =============================================================================
// Query Model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Default,
    Exact,
    Prefix,
    Host,
    Domain,
    Range,
}

impl MatchType {
    fn from_param(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "exact" => Ok(Self::Exact),
            "prefix" => Ok(Self::Prefix),
            "host" => Ok(Self::Host),
            "domain" => Ok(Self::Domain),
            "range" => Ok(Self::Range),
            other => Err(Error::bad_request(format!("unknown matchType: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sort {
    Default,
    Closest,
    Reverse,
}

impl Sort {
    fn from_param(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "closest" => Ok(Self::Closest),
            "reverse" => Ok(Self::Reverse),
            other => Err(Error::bad_request(format!("unknown sort: {other}"))),
        }
    }
}

/// Response serialization, a closed set rather than anything extensible:
/// CDX text, JSON arrays, and the legacy XML shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Cdx,
    Json,
    Xml,
}

/// Default CDX11 field list.
pub const DEFAULT_FIELDS: [&str; 11] = [
    "urlkey",
    "timestamp",
    "url",
    "mime",
    "status",
    "digest",
    "redirecturl",
    "robotflags",
    "length",
    "offset",
    "filename",
];

/// Extra locator fields when the CDX14 schema is enabled.
pub const CDX14_EXTRA_FIELDS: [&str; 3] = ["originalLength", "originalOffset", "originalFilename"];

fn default_fields(cdx14: bool) -> Vec<String> {
    let mut fields: Vec<String> = DEFAULT_FIELDS.iter().map(|s| s.to_string()).collect();
    if cdx14 {
        fields.extend(CDX14_EXTRA_FIELDS.iter().map(|s| s.to_string()));
    }
    fields
}

fn is_known_field(name: &str) -> bool {
    Capture::default().field(name).is_some()
}

/// A filter predicate applied to each capture in the pipeline.
pub type CapturePredicate = Box<dyn Fn(&Capture) -> bool + Send>;

/// Host-supplied filter factory. Plugins see the full parameter map and are
/// registered as an explicit list at startup; they run after the built-in
/// `filter=` predicates, in registration order.
pub trait FilterPlugin: Send + Sync {
    fn new_filter(&self, params: &ParamMap) -> Result<CapturePredicate>;
}

/// Parsed `collapse` spec: a field, optionally truncated to a length.
#[derive(Debug, Clone)]
struct CollapseSpec {
    field: String,
    chars: Option<usize>,
}

impl CollapseSpec {
    fn parse(spec: &str) -> Result<Self> {
        let (field, chars) = match spec.split_once(':') {
            Some((field, n)) => {
                let n = n
                    .parse::<usize>()
                    .map_err(|_| Error::bad_request(format!("bad collapse length: {spec}")))?;
                (field, Some(n))
            }
            None => (spec, None),
        };
        if field.is_empty() {
            return Err(Error::bad_request("collapse requires a field name".to_string()));
        }
        if !is_known_field(field) {
            return Err(Error::bad_request(format!("unknown collapse field: {field}")));
        }
        Ok(Self {
            field: field.to_string(),
            chars,
        })
    }

    fn value_of(&self, capture: &Capture) -> String {
        let value = capture.field(&self.field).unwrap_or_else(|| "-".to_string());
        match self.chars {
            Some(n) => value.chars().take(n).collect(),
            None => value,
        }
    }
}

/// A parsed, validated query.
pub struct Query {
    pub access_point: Option<String>,
    pub match_type: MatchType,
    pub sort: Sort,
    pub url: Option<String>,
    pub urlkey: Option<String>,
    pub method: Option<String>,
    pub request_body: Option<String>,
    pub closest: Option<String>,
    pub from: u64,
    pub to: u64,
    pub limit: u64,
    pub fields: Vec<String>,
    pub output: OutputFormat,
    pub omit_self_redirects: bool,
    end_url: Option<String>,
    end_urlkey: Option<String>,
    filters: Vec<CapturePredicate>,
    collapse_first: Option<CollapseSpec>,
    collapse_last: Option<CollapseSpec>,
}

impl Query {
    /// Parses and validates request parameters.
    pub fn parse(
        params: &ParamMap,
        plugins: &[Box<dyn FilterPlugin>],
        config: &Config,
    ) -> Result<Query> {
        let match_type = MatchType::from_param(params.get("matchType").unwrap_or("default"))?;
        let sort = Sort::from_param(params.get("sort").unwrap_or("default"))?;

        let from = match params.get("from") {
            Some(v) => timestamp14(v, '0')?,
            None => MIN_TIMESTAMP,
        };
        let to = match params.get("to") {
            Some(v) => timestamp14(v, '9')?,
            None => MAX_TIMESTAMP,
        };

        let mut filters: Vec<CapturePredicate> = Vec::new();
        for spec in params.get_all("filter") {
            filters.push(field_filter(spec)?);
        }
        for plugin in plugins {
            filters.push(plugin.new_filter(params)?);
        }

        // collapse / collapseToFirst are one knob; collapseToLast is its own
        let collapse_first = params
            .get("collapseToFirst")
            .or_else(|| params.get("collapse"))
            .map(CollapseSpec::parse)
            .transpose()?;
        let collapse_last = match collapse_first {
            Some(_) => None,
            None => params
                .get("collapseToLast")
                .map(CollapseSpec::parse)
                .transpose()?,
        };

        let fields = match params.get("fl") {
            Some(fl) => {
                let fields: Vec<String> = fl.split(',').map(|f| f.trim().to_string()).collect();
                for field in &fields {
                    if !is_known_field(field) {
                        return Err(Error::bad_request(format!("unknown field: {field}")));
                    }
                }
                fields
            }
            None => default_fields(config.cdx14),
        };

        let mut limit = match params.get("limit") {
            Some(v) => v
                .parse::<u64>()
                .map_err(|_| Error::bad_request(format!("bad limit: {v}")))?,
            None => u64::MAX,
        };
        if config.max_num_results > 0 {
            limit = limit.min(config.max_num_results);
        }

        let output = match params.get("output") {
            Some("json") => OutputFormat::Json,
            Some("xml") => OutputFormat::Xml,
            _ => OutputFormat::Cdx,
        };

        let mut query = Query {
            access_point: params.get("accesspoint").map(str::to_string),
            match_type,
            sort,
            url: params.get("url").map(str::to_string),
            urlkey: params.get("urlkey").map(str::to_string),
            method: params.get("method").map(str::to_string),
            request_body: params.get("requestBody").map(str::to_string),
            closest: params.get("closest").map(str::to_string),
            from,
            to,
            limit,
            fields,
            output,
            omit_self_redirects: params
                .get("omitSelfRedirects")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            end_url: params.get("endUrl").map(str::to_string),
            end_urlkey: params.get("endUrlkey").map(str::to_string),
            filters,
            collapse_first,
            collapse_last,
        };

        query.compatibility_hacks();
        query.expand_wildcards();
        query.validate()?;
        Ok(query)
    }

    /// pywb 2.0 sends `sort=closest&closest=` on some requests; treat that
    /// as an unsorted query instead of rejecting it.
    fn compatibility_hacks(&mut self) {
        if self.sort == Sort::Closest && self.closest.as_deref().unwrap_or("").is_empty() {
            self.sort = Sort::Default;
        }
    }

    fn expand_wildcards(&mut self) {
        if self.match_type == MatchType::Default {
            match &self.url {
                Some(url) if url.ends_with('*') => self.match_type = MatchType::Prefix,
                Some(url) if url.starts_with("*.") => self.match_type = MatchType::Domain,
                _ => self.match_type = MatchType::Exact,
            }
        }
        // Explicit prefix/domain queries may still carry the wildcard
        // markers; they are notation, not part of the key.
        match (self.match_type, &mut self.url) {
            (MatchType::Prefix, Some(url)) if url.ends_with('*') => {
                url.truncate(url.len() - 1);
            }
            (MatchType::Domain, Some(url)) if url.starts_with("*.") => {
                url.replace_range(..2, "");
            }
            _ => {}
        }
    }

    fn validate(&self) -> Result<()> {
        if self.url.is_some() == self.urlkey.is_some() {
            return Err(Error::bad_request(
                "exactly one of 'url' or 'urlkey' is required".to_string(),
            ));
        }
        match self.sort {
            Sort::Closest => {
                if self.match_type != MatchType::Exact {
                    return Err(Error::bad_request(
                        "sort=closest is only implemented for exact matches".to_string(),
                    ));
                }
                if self.closest.is_none() {
                    return Err(Error::bad_request(
                        "closest={timestamp} is mandatory when using sort=closest".to_string(),
                    ));
                }
            }
            Sort::Reverse => {
                if self.match_type != MatchType::Exact {
                    return Err(Error::bad_request(
                        "sort=reverse is only implemented for exact matches".to_string(),
                    ));
                }
            }
            Sort::Default => {}
        }
        if self.from != MIN_TIMESTAMP || self.to != MAX_TIMESTAMP {
            if self.match_type != MatchType::Exact {
                return Err(Error::bad_request(
                    "from/to are only implemented for exact matches".to_string(),
                ));
            }
            if self.sort == Sort::Closest {
                return Err(Error::bad_request(
                    "from/to are not implemented for sort=closest".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Builds a predicate from a `filter=` spec: `[!]<field>:<regex>`, matched
/// against the whole field value.
fn field_filter(spec: &str) -> Result<CapturePredicate> {
    let (negate, rest) = match spec.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, spec),
    };
    let (field, pattern) = rest
        .split_once(':')
        .ok_or_else(|| Error::bad_request(format!("bad filter (expected field:regex): {spec}")))?;
    if !is_known_field(field) {
        return Err(Error::bad_request(format!("unknown filter field: {field}")));
    }
    let regex = Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| Error::bad_request(format!("bad filter regex '{pattern}': {e}")))?;

    let field = field.to_string();
    Ok(Box::new(move |capture: &Capture| {
        let matched = capture
            .field(&field)
            .map(|value| regex.is_match(&value))
            .unwrap_or(false);
        matched != negate
    }))
}

// =============================================================================
// Executor
// =============================================================================

/// Runs queries against one collection.
pub struct QueryExecutor<'a> {
    index: &'a Index,
    canonicalizer: &'a Canonicalizer,
    config: &'a Config,
    plugins: &'a [Box<dyn FilterPlugin>],
}

/// The executed pipeline, ready to stream.
///
/// Owns the underlying scan (snapshot, connection, buffers); dropping the
/// outcome releases all of it.
pub struct QueryOutcome<'a> {
    captures: std::iter::Peekable<Box<dyn Iterator<Item = Result<Capture>> + 'a>>,
    truncated: Arc<AtomicBool>,
    /// Fields each serialized capture carries, in order.
    pub fields: Vec<String>,
    pub output: OutputFormat,
    /// When the queried urlkey resolved through an alias, the target key the
    /// results actually come from.
    pub resolved_target: Option<String>,
}

impl<'a> Iterator for QueryOutcome<'a> {
    type Item = Result<Capture>;

    fn next(&mut self) -> Option<Self::Item> {
        self.captures.next()
    }
}

impl<'a> QueryOutcome<'a> {
    /// True once the deadline truncated the stream; meaningful after the
    /// iterator has been drained (or has stopped early).
    pub fn was_truncated(&self) -> bool {
        self.truncated.load(Ordering::Relaxed)
    }

    fn is_empty(&mut self) -> bool {
        self.captures.peek().is_none()
    }
}

impl<'a> QueryExecutor<'a> {
    pub fn new(
        index: &'a Index,
        canonicalizer: &'a Canonicalizer,
        config: &'a Config,
        plugins: &'a [Box<dyn FilterPlugin>],
    ) -> Self {
        Self {
            index,
            canonicalizer,
            config,
            plugins,
        }
    }

    /// Parses, plans, and starts a query.
    pub fn execute(&self, params: &ParamMap) -> Result<QueryOutcome<'a>> {
        let query = Query::parse(params, self.plugins, self.config)?;
        let mut outcome = self.run(query)?;

        // Workaround for a dataset whose WARCs wrote `+` where URLs said
        // `%20`. Retried at most once; the retry pass is never retried.
        if self.config.cdx_plus_workaround && outcome.is_empty() {
            if let Some(url) = params.get("url") {
                if url.contains("%20") || url.contains(' ') {
                    let substituted = url.replace("%20", "+").replace(' ', "+");
                    let retry = params.with_replaced("url", &substituted);
                    let retry_query = Query::parse(&retry, self.plugins, self.config)?;
                    outcome = self.run(retry_query)?;
                }
            }
        }
        Ok(outcome)
    }

    fn run(&self, query: Query) -> Result<QueryOutcome<'a>> {
        // ---- key derivation --------------------------------------------
        let requested_key = match (&query.urlkey, &query.url) {
            (Some(key), _) => key.clone(),
            (None, Some(url)) => self.canonicalizer.surt_for_request(
                url,
                query.method.as_deref(),
                query.request_body.as_deref(),
            )?,
            (None, None) => unreachable!("validated"),
        };

        // ---- alias resolution ------------------------------------------
        let resolved_target = self.index.resolve_alias(&requested_key)?;
        let urlkey = resolved_target.clone().unwrap_or(requested_key);

        // ---- scan bounds per match type --------------------------------
        let mut domain_prefix: Option<String> = None;
        let base: Box<dyn Iterator<Item = Result<Capture>> + 'a> = match query.sort {
            Sort::Closest => {
                let closest_ts =
                    timestamp14(query.closest.as_deref().expect("validated"), '0')?;
                Box::new(self.closest_iter(&urlkey, closest_ts)?)
            }
            Sort::Reverse => {
                let prefix = capture_key_prefix_exact(&urlkey);
                let upper = prefix_successor(&prefix).unwrap_or(vec![NS_CAPTURE + 1]);
                Box::new(self.index.scan_captures(ScanBounds {
                    lower: prefix,
                    upper: Some(upper),
                    reverse: true,
                })?)
            }
            Sort::Default => {
                let (lower, upper) = match query.match_type {
                    MatchType::Exact | MatchType::Default => {
                        let prefix = capture_key_prefix_exact(&urlkey);
                        let upper = prefix_successor(&prefix).unwrap_or(vec![NS_CAPTURE + 1]);
                        (prefix, Some(upper))
                    }
                    MatchType::Prefix => {
                        let prefix = capture_key_prefix(&urlkey);
                        let upper = prefix_successor(&prefix).unwrap_or(vec![NS_CAPTURE + 1]);
                        (prefix, Some(upper))
                    }
                    MatchType::Host => {
                        let host = match &query.url {
                            Some(url) => format!("{})", self.canonicalizer.surt_host(url)?),
                            None => urlkey.clone(),
                        };
                        let prefix = capture_key_prefix(&host);
                        let upper = prefix_successor(&prefix).unwrap_or(vec![NS_CAPTURE + 1]);
                        (prefix, Some(upper))
                    }
                    MatchType::Domain => {
                        let domain = match &query.url {
                            Some(url) => self.canonicalizer.surt_domain(url)?,
                            None => urlkey.clone(),
                        };
                        let prefix = capture_key_prefix(&domain);
                        let upper = prefix_successor(&prefix).unwrap_or(vec![NS_CAPTURE + 1]);
                        domain_prefix = Some(domain);
                        (prefix, Some(upper))
                    }
                    MatchType::Range => {
                        let lower = capture_key_prefix(&urlkey);
                        let upper = match (&query.end_urlkey, &query.end_url) {
                            (Some(key), _) => Some(capture_key_prefix(key)),
                            (None, Some(url)) => {
                                Some(capture_key_prefix(&self.canonicalizer.surt(url)?))
                            }
                            (None, None) => Some(vec![NS_CAPTURE + 1]),
                        };
                        (lower, upper)
                    }
                };
                Box::new(self.index.scan_captures(ScanBounds {
                    lower,
                    upper,
                    reverse: false,
                })?)
            }
        };

        // ---- pipeline ---------------------------------------------------
        let mut iter = base;

        // The domain range also covers sibling hosts that merely extend the
        // last label (`com,examplez`); keep only true subdomain boundaries.
        if let Some(prefix) = domain_prefix {
            iter = Box::new(iter.filter(move |item| match item {
                Ok(c) => matches!(
                    c.urlkey.as_bytes().get(prefix.len()),
                    Some(b')') | Some(b',') | Some(b':')
                ),
                Err(_) => true,
            }));
        }

        if query.from != MIN_TIMESTAMP || query.to != MAX_TIMESTAMP {
            let (from, to) = (query.from, query.to);
            iter = Box::new(iter.filter(move |item| match item {
                Ok(c) => c.timestamp >= from && c.timestamp <= to,
                Err(_) => true,
            }));
        }

        if !query.filters.is_empty() {
            let filters = query.filters;
            iter = Box::new(iter.filter(move |item| match item {
                Ok(c) => filters.iter().all(|f| f(c)),
                Err(_) => true,
            }));
        }

        if query.omit_self_redirects {
            let canonicalizer = self.canonicalizer.clone();
            iter = Box::new(iter.filter(move |item| match item {
                Ok(c) => !is_self_redirect(&canonicalizer, c),
                Err(_) => true,
            }));
        }

        if let Some(access_point) = query.access_point.clone() {
            let index = self.index;
            let access_time = now_ts14();
            iter = Box::new(iter.filter(move |item| match item {
                Ok(c) => index
                    .check_access_surt(&access_point, &c.urlkey, c.timestamp, access_time)
                    .map(|d| d.allowed)
                    .unwrap_or(false),
                Err(_) => true,
            }));
        }

        // collapse is the terminal stage before limit
        if let Some(spec) = query.collapse_first {
            iter = Box::new(CollapseFirst {
                inner: iter,
                spec,
                last: None,
            });
        } else if let Some(spec) = query.collapse_last {
            iter = Box::new(CollapseLast {
                inner: iter,
                spec,
                pending: None,
                done: false,
            });
        }

        if query.limit != u64::MAX {
            iter = Box::new(iter.take(query.limit.min(usize::MAX as u64) as usize));
        }

        let truncated = Arc::new(AtomicBool::new(false));
        if self.config.query_timeout_ms > 0 {
            iter = Box::new(DeadlineIter {
                inner: iter,
                deadline: Instant::now() + Duration::from_millis(self.config.query_timeout_ms),
                truncated: Arc::clone(&truncated),
            });
        }

        Ok(QueryOutcome {
            captures: iter.peekable(),
            truncated,
            fields: query.fields,
            output: query.output,
            resolved_target,
        })
    }

    fn closest_iter(&self, urlkey: &str, closest_ts: u64) -> Result<ClosestIter<CaptureIter>> {
        let prefix = capture_key_prefix_exact(urlkey);
        let upper = prefix_successor(&prefix).unwrap_or(vec![NS_CAPTURE + 1]);
        let anchor = capture_key_at(urlkey, closest_ts);

        let forward = self.index.scan_captures(ScanBounds {
            lower: anchor.clone(),
            upper: Some(upper),
            reverse: false,
        })?;
        let backward = self.index.scan_captures(ScanBounds {
            lower: prefix,
            upper: Some(anchor),
            reverse: true,
        })?;

        Ok(ClosestIter {
            forward: forward.peekable(),
            backward: backward.peekable(),
            closest: closest_ts,
        })
    }
}

/// True when the capture redirects to its own canonicalized URL.
fn is_self_redirect(canonicalizer: &Canonicalizer, capture: &Capture) -> bool {
    if capture.redirecturl.is_empty() || capture.redirecturl == "-" {
        return false;
    }
    let absolute = if capture.redirecturl.contains("://") {
        capture.redirecturl.clone()
    } else if let Some(base) = surt_to_url(&capture.urlkey) {
        // relative redirect: resolve against the capture's own host
        match base.find("://").map(|i| i + 3) {
            Some(host_start) => {
                let host_end = base[host_start..]
                    .find('/')
                    .map(|i| host_start + i)
                    .unwrap_or(base.len());
                format!("{}{}", &base[..host_end], capture.redirecturl)
            }
            None => return false,
        }
    } else {
        return false;
    };
    match canonicalizer.surt(&absolute) {
        Ok(key) => key == capture.urlkey,
        Err(_) => false,
    }
}

// =============================================================================
// Pipeline Iterators
// =============================================================================

/// Merges a forward and a backward exact-match scan into
/// `|timestamp − closest|` order, ties to the earlier timestamp.
struct ClosestIter<I: Iterator<Item = Result<Capture>>> {
    forward: std::iter::Peekable<I>,
    backward: std::iter::Peekable<I>,
    closest: u64,
}

impl<I: Iterator<Item = Result<Capture>>> Iterator for ClosestIter<I> {
    type Item = Result<Capture>;

    fn next(&mut self) -> Option<Self::Item> {
        // Surface scan errors from whichever side hits one first.
        if matches!(self.forward.peek(), Some(Err(_))) {
            return self.forward.next();
        }
        if matches!(self.backward.peek(), Some(Err(_))) {
            return self.backward.next();
        }

        let fwd_ts = match self.forward.peek() {
            Some(Ok(c)) => Some(c.timestamp),
            _ => None,
        };
        let bwd_ts = match self.backward.peek() {
            Some(Ok(c)) => Some(c.timestamp),
            _ => None,
        };

        match (fwd_ts, bwd_ts) {
            (None, None) => None,
            (Some(_), None) => self.forward.next(),
            (None, Some(_)) => self.backward.next(),
            (Some(f), Some(b)) => {
                let fd = f.abs_diff(self.closest);
                let bd = b.abs_diff(self.closest);
                // tie: prefer the earlier timestamp, which is the backward side
                if fd < bd {
                    self.forward.next()
                } else {
                    self.backward.next()
                }
            }
        }
    }
}

/// Keeps the first capture of each run of equal collapse-field values.
struct CollapseFirst<I> {
    inner: I,
    spec: CollapseSpec,
    last: Option<String>,
}

impl<I: Iterator<Item = Result<Capture>>> Iterator for CollapseFirst<I> {
    type Item = Result<Capture>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(capture) => {
                    let value = self.spec.value_of(&capture);
                    if self.last.as_deref() != Some(value.as_str()) {
                        self.last = Some(value);
                        return Some(Ok(capture));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Keeps the last capture of each run of equal collapse-field values.
///
/// Cannot be a stateless predicate: a capture is only known to be the last
/// of its run once the next one arrives, so one capture is held back and
/// emitted when the value changes or the stream ends.
struct CollapseLast<I> {
    inner: I,
    spec: CollapseSpec,
    pending: Option<(String, Capture)>,
    done: bool,
}

impl<I: Iterator<Item = Result<Capture>>> Iterator for CollapseLast<I> {
    type Item = Result<Capture>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.inner.next() {
                Some(Ok(capture)) => {
                    let value = self.spec.value_of(&capture);
                    let same_run = self
                        .pending
                        .as_ref()
                        .is_some_and(|(pending_value, _)| *pending_value == value);
                    if same_run || self.pending.is_none() {
                        self.pending = Some((value, capture));
                    } else {
                        let emitted = self.pending.replace((value, capture));
                        return emitted.map(|(_, c)| Ok(c));
                    }
                }
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    self.done = true;
                    return self.pending.take().map(|(_, c)| Ok(c));
                }
            }
        }
    }
}

/// Stops the stream once the wall-clock budget is spent, marking the
/// outcome truncated.
struct DeadlineIter<I> {
    inner: I,
    deadline: Instant,
    truncated: Arc<AtomicBool>,
}

impl<I: Iterator<Item = Result<Capture>>> Iterator for DeadlineIter<I> {
    type Item = Result<Capture>;

    fn next(&mut self) -> Option<Self::Item> {
        if Instant::now() >= self.deadline {
            self.truncated.store(true, Ordering::Relaxed);
            return None;
        }
        self.inner.next()
    }
}

// =============================================================================
// Serialization
// =============================================================================

/// Renders the outcome in its requested format.
pub fn render(outcome: &mut QueryOutcome<'_>) -> Result<String> {
    match outcome.output {
        OutputFormat::Cdx => render_cdx(outcome),
        OutputFormat::Json => render_json(outcome),
        OutputFormat::Xml => render_xml(outcome),
    }
}

/// Space-delimited text, one capture per line, missing fields as `-`.
pub fn render_cdx(outcome: &mut QueryOutcome<'_>) -> Result<String> {
    let fields: Vec<&str> = outcome.fields.iter().map(String::as_str).collect();
    let mut out = String::new();
    while let Some(capture) = outcome.captures.next() {
        let capture = capture?;
        out.push_str(&capture.to_cdx_line(&fields));
        out.push('\n');
    }
    Ok(out)
}

/// An array of arrays; the first inner array is the field-name header.
pub fn render_json(outcome: &mut QueryOutcome<'_>) -> Result<String> {
    let fields = outcome.fields.clone();
    let mut rows: Vec<Vec<String>> = vec![fields.clone()];
    while let Some(capture) = outcome.captures.next() {
        let capture = capture?;
        rows.push(
            fields
                .iter()
                .map(|f| capture.field(f).unwrap_or_else(|| "-".to_string()))
                .collect(),
        );
    }
    serde_json::to_string(&rows).map_err(|e| Error::Internal(format!("json encoding: {e}")))
}

/// Legacy XML shim: the same capture stream as flat `<result>` elements.
pub fn render_xml(outcome: &mut QueryOutcome<'_>) -> Result<String> {
    let fields = outcome.fields.clone();
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<results>");
    while let Some(capture) = outcome.captures.next() {
        let capture = capture?;
        out.push_str("<result>");
        for field in &fields {
            let value = capture.field(field).unwrap_or_else(|| "-".to_string());
            out.push('<');
            out.push_str(field);
            out.push('>');
            out.push_str(&xml_escape(&value));
            out.push_str("</");
            out.push_str(field);
            out.push('>');
        }
        out.push_str("</result>");
    }
    out.push_str("</results>\n");
    Ok(out)
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

// =============================================================================
// Tests
// =============================================================================
