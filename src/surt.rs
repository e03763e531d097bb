//! # SURT Canonicalization
//!
//! This module turns URLs into SURT keys (Sort-friendly URI Reordering
//! Transform): the host labels are reversed and comma-joined so that related
//! URLs become adjacent under plain byte ordering.
//!
//! ```text
//! http://www.example.com/about?b=2&a=1  →  com,example)/about?a=1&b=2
//! http://shop.example.com/              →  com,example,shop)/
//! ```
//!
//! Byte-sorting SURT keys groups a domain, then its subdomains, then each
//! host's paths, which is what makes exact/prefix/host/domain queries plain
//! range scans over the index.
//!
//! ## Determinism
//!
//! Canonicalization is a pure function of the URL and the [`CanonConfig`].
//! Every key in a collection was produced under one configuration; changing
//! any knob is a reindex, not a restart.
//!
//! The transform, in order:
//!
//! 1. lowercase scheme and host, drop userinfo and any fragment
//! 2. strip the default port and (by policy) a leading `www.` label
//! 3. percent-decode unreserved characters, re-encode reserved ones in
//!    uppercase hex
//! 4. resolve `.`/`..` path segments and collapse `//` (trailing slash kept
//!    as given); strip session markers by policy
//! 5. drop blocklisted tracking parameters, sort the rest, rejoin with `&`
//! 6. reverse host labels, join with commas, close with `)`
//!
//! Non-GET requests are keyed by appending `__wb_method=<METHOD>` and the
//! request body as extra query parameters before sorting, so a POST capture
//! collates next to its GET but never collides with it.

use crate::config::CanonConfig;
use crate::error::{Error, Result};

// =============================================================================
// Canonicalizer
// =============================================================================

/// Produces SURT keys from URLs under a fixed [`CanonConfig`].
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    config: CanonConfig,
}

impl Canonicalizer {
    pub fn new(config: CanonConfig) -> Self {
        Self { config }
    }

    /// Canonicalizes an absolute URL into its SURT key.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidUrl`] for non-absolute input, an empty host, or
    /// invalid percent-encoding.
    pub fn surt(&self, url: &str) -> Result<String> {
        let parts = self.parse(url)?;
        let mut key = parts.surt_host();
        key.push(')');
        key.push_str(&parts.path);
        if !parts.query.is_empty() {
            key.push('?');
            key.push_str(&parts.query);
        }
        Ok(key)
    }

    /// Canonicalizes the URL of a possibly non-GET request.
    ///
    /// For anything other than GET the method (uppercased) and the request
    /// body are appended as query parameters under the `__wb_method` marker
    /// before canonicalization, matching how such captures are keyed at
    /// ingest time.
    pub fn surt_for_request(
        &self,
        url: &str,
        method: Option<&str>,
        request_body: Option<&str>,
    ) -> Result<String> {
        match method {
            Some(m) if !m.eq_ignore_ascii_case("GET") => {
                let mut augmented = String::from(url);
                augmented.push(if url.contains('?') { '&' } else { '?' });
                augmented.push_str("__wb_method=");
                augmented.push_str(&m.to_ascii_uppercase());
                if let Some(body) = request_body {
                    if !body.is_empty() {
                        augmented.push('&');
                        augmented.push_str(body);
                    }
                }
                self.surt(&augmented)
            }
            _ => self.surt(url),
        }
    }

    /// Returns the reversed-host portion of the SURT key, without the
    /// closing parenthesis: `http://shop.example.com/x` → `com,example,shop`.
    ///
    /// Host-match scans use this plus `)` as their prefix.
    pub fn surt_host(&self, url: &str) -> Result<String> {
        Ok(self.parse(url)?.surt_host())
    }

    /// Returns the SURT prefix shared by a registered domain and every host
    /// under it: `example.com` → `com,example`.
    ///
    /// The input is a bare domain (the remainder after stripping a leading
    /// `*.`), but a full URL is accepted too.
    pub fn surt_domain(&self, domain_or_url: &str) -> Result<String> {
        if domain_or_url.contains("://") {
            return self.surt_host(domain_or_url);
        }
        let bare = domain_or_url
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default();
        let host = normalize_host(bare, &self.config)
            .ok_or_else(|| invalid(domain_or_url, "empty host"))?;
        Ok(reverse_host(&host))
    }

    fn parse(&self, url: &str) -> Result<UrlParts> {
        UrlParts::parse(url, &self.config)
    }
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self::new(CanonConfig::default())
    }
}

/// Reconstructs a plain URL from a SURT key, when the key is well-formed.
///
/// The scheme is not recorded in SURT keys, so `http://` is assumed. Used by
/// self-redirect detection and the canonicalization idempotence tests.
pub fn surt_to_url(surt: &str) -> Option<String> {
    let paren = surt.find(')')?;
    let (host_part, rest) = surt.split_at(paren);
    let rest = &rest[1..];

    let (labels, port) = match host_part.rfind(':') {
        Some(i) => (&host_part[..i], Some(&host_part[i + 1..])),
        None => (host_part, None),
    };
    let mut host: Vec<&str> = labels.split(',').collect();
    if host.iter().any(|l| l.is_empty()) {
        return None;
    }
    host.reverse();

    let mut url = String::from("http://");
    url.push_str(&host.join("."));
    if let Some(p) = port {
        url.push(':');
        url.push_str(p);
    }
    if rest.is_empty() {
        url.push('/');
    } else {
        url.push_str(rest);
    }
    Some(url)
}

// =============================================================================
// URL Decomposition
// =============================================================================

/// An absolute URL after normalization, ready for SURT rendering.
struct UrlParts {
    host: String,
    port: Option<u16>,
    path: String,
    query: String,
}

impl UrlParts {
    fn parse(url: &str, config: &CanonConfig) -> Result<UrlParts> {
        // Fragment never participates in keying.
        let url = match url.find('#') {
            Some(i) => &url[..i],
            None => url,
        };

        let scheme_end = url
            .find("://")
            .ok_or_else(|| invalid(url, "not an absolute URL"))?;
        let scheme = url[..scheme_end].to_ascii_lowercase();
        if scheme.is_empty() || !scheme.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'-' || b == b'.') {
            return Err(invalid(url, "malformed scheme"));
        }
        let rest = &url[scheme_end + 3..];

        let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(authority_end);

        // Userinfo is dropped: it never distinguishes archived captures.
        let authority = match authority.rfind('@') {
            Some(i) => &authority[i + 1..],
            None => authority,
        };

        let (host_raw, port) = split_port(authority, url)?;
        let host = normalize_host(host_raw, config).ok_or_else(|| invalid(url, "empty host"))?;
        let port = port.filter(|p| !is_default_port(&scheme, *p));

        let (path_raw, query_raw) = match tail.find('?') {
            Some(i) => (&tail[..i], &tail[i + 1..]),
            None => (tail, ""),
        };

        let path = normalize_path(path_raw, config, url)?;
        let query = normalize_query(query_raw, config, url)?;

        Ok(UrlParts {
            host,
            port,
            path,
            query,
        })
    }

    fn surt_host(&self) -> String {
        let mut out = reverse_host(&self.host);
        if let Some(p) = self.port {
            out.push(':');
            out.push_str(&p.to_string());
        }
        out
    }
}

fn invalid(url: &str, reason: &str) -> Error {
    Error::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

fn split_port<'a>(authority: &'a str, url: &str) -> Result<(&'a str, Option<u16>)> {
    match authority.rfind(':') {
        Some(i) => {
            let port_str = &authority[i + 1..];
            if port_str.is_empty() {
                return Ok((&authority[..i], None));
            }
            let port = port_str
                .parse::<u16>()
                .map_err(|_| invalid(url, "invalid port"))?;
            Ok((&authority[..i], Some(port)))
        }
        None => Ok((authority, None)),
    }
}

fn is_default_port(scheme: &str, port: u16) -> bool {
    matches!((scheme, port), ("http", 80) | ("https", 443) | ("ftp", 21))
}

fn normalize_host(host: &str, config: &CanonConfig) -> Option<String> {
    let mut host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if config.strip_www {
        if let Some(rest) = strip_www_label(&host) {
            host = rest.to_string();
        }
    }
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Strips a leading `www.`, `www2.`, … label, but never down to a bare TLD.
fn strip_www_label(host: &str) -> Option<&str> {
    let rest = host.strip_prefix("www")?;
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
    let rest = rest.strip_prefix('.')?;
    if rest.contains('.') {
        Some(rest)
    } else {
        None
    }
}

fn reverse_host(host: &str) -> String {
    let mut labels: Vec<&str> = host.split('.').collect();
    labels.reverse();
    labels.join(",")
}

// =============================================================================
// Percent-Encoding Normalization
// =============================================================================

/// Characters kept literal in normalized paths and queries, beyond
/// alphanumerics. Everything else is percent-encoded.
const SAFE: &[u8] = b"-._~!$&'()*+,/:;=@";

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Normalizes percent-encoding in one URL component.
///
/// Percent-decodes unreserved characters to their literal form, re-encodes
/// everything else as uppercase `%XX`, and encodes literal bytes that are
/// neither safe nor unreserved. Fails on truncated or non-hex escapes.
fn normalize_escapes(component: &str, url: &str) -> Result<String> {
    let bytes = component.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' {
            let (hi, lo) = match (bytes.get(i + 1), bytes.get(i + 2)) {
                (Some(&h), Some(&l)) => match (hex_value(h), hex_value(l)) {
                    (Some(h), Some(l)) => (h, l),
                    _ => return Err(invalid(url, "invalid percent-escape")),
                },
                _ => return Err(invalid(url, "truncated percent-escape")),
            };
            let decoded = hi * 16 + lo;
            if is_unreserved(decoded) {
                out.push(decoded as char);
            } else {
                out.push_str(&format!("%{decoded:02X}"));
            }
            i += 3;
        } else if is_unreserved(b) || SAFE.contains(&b) {
            out.push(b as char);
            i += 1;
        } else {
            // Literal byte outside the safe set (space, control, non-ASCII):
            // encode it. Multi-byte UTF-8 comes through as individual bytes.
            out.push_str(&format!("%{b:02X}"));
            i += 1;
        }
    }
    Ok(out)
}

// =============================================================================
// Path Normalization
// =============================================================================

fn normalize_path(path: &str, config: &CanonConfig, url: &str) -> Result<String> {
    if path.is_empty() {
        return Ok("/".to_string());
    }
    // Lowercase before escape normalization so hex digits come out upper.
    let raw;
    let path = if config.lowercase_path {
        raw = path.to_ascii_lowercase();
        raw.as_str()
    } else {
        path
    };
    let mut path = normalize_escapes(path, url)?;

    if config.strip_session_ids {
        path = strip_path_session_id(&path);
    }

    // Resolve `.`/`..` and collapse empty segments, keeping a trailing
    // slash when the input had one.
    let had_trailing_slash =
        path.ends_with('/') || path.ends_with("/.") || path.ends_with("/..");
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut out = String::from("/");
    out.push_str(&segments.join("/"));
    if had_trailing_slash && !out.ends_with('/') {
        out.push('/');
    }
    Ok(out)
}

/// Removes a `;jsessionid=...` path parameter (case-insensitive).
fn strip_path_session_id(path: &str) -> String {
    let lower = path.to_ascii_lowercase();
    match lower.find(";jsessionid=") {
        Some(start) => {
            let rest = &path[start..];
            let end = rest[1..].find(['/', '?', ';']).map(|i| start + 1 + i).unwrap_or(path.len());
            let mut out = String::with_capacity(path.len());
            out.push_str(&path[..start]);
            out.push_str(&path[end..]);
            out
        }
        None => path.to_string(),
    }
}

// =============================================================================
// Query Normalization
// =============================================================================

/// Query parameter names treated as session identifiers.
const SESSION_PARAMS: &[&str] = &["jsessionid", "phpsessid", "sid", "sessionid", "session_id", "cfid", "cftoken"];

fn normalize_query(query: &str, config: &CanonConfig, url: &str) -> Result<String> {
    if query.is_empty() {
        return Ok(String::new());
    }

    let mut params: Vec<String> = Vec::new();
    for raw in query.split('&') {
        if raw.is_empty() {
            continue;
        }
        let normalized = normalize_escapes(raw, url)?;
        let name = normalized.split('=').next().unwrap_or("").to_ascii_lowercase();

        if config.tracking_param_blocklist.contains(&name) {
            continue;
        }
        if config.strip_session_ids
            && (SESSION_PARAMS.contains(&name.as_str()) || name.starts_with("aspsessionid"))
        {
            continue;
        }
        params.push(normalized);
    }

    // Lexicographic parameter order; empty values survive ("a=" stays "a=").
    params.sort();
    Ok(params.join("&"))
}

// =============================================================================
// Tests
// =============================================================================
