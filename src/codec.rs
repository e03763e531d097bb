//! # Record Codec
//!
//! Packed binary encoding for everything the index stores. Keys are built so
//! that plain byte comparison over the encoded form equals component-wise
//! comparison over `(urlkey, timestamp, filename, offset)` — the property the
//! whole query planner leans on.
//!
//! ## Keyspaces
//!
//! The leading byte of every key names its namespace, keeping record kinds
//! disjoint inside one ordered store:
//!
//! | Byte | Contents |
//! |------|----------|
//! | `0x01` | captures |
//! | `0x02` | aliases |
//! | `0x03` | access rules |
//! | `0x04` | access policies |
//! | `0x05` | sequence / configuration metadata |
//!
//! ## Key Layout
//!
//! ```text
//! capture: 01 esc(urlkey) 00 ts[8,BE] esc(filename) 00 offset[8,BE]
//! alias:   02 esc(surt) 00
//! rule:    03 id[8,BE]        policy: 04 id[8,BE]        meta: 05 name
//! ```
//!
//! Variable-length components escape `0x00` as `0x00 0xFF` and end with a
//! single `0x00` terminator. The escape keeps ordering intact and makes it
//! impossible for two different tuples to alias one key. Timestamps are at
//! most 14 decimal digits (< 2^47), so the first big-endian timestamp byte is
//! always zero; exact-match scan prefixes rely on that.
//!
//! ## Value Layout
//!
//! Values carry a 1-byte version. Version 1 holds the CDX11 fields; version 2
//! appends the three `original_*` locator fields behind presence flags.
//! Decoders accept both and report anything newer as
//! [`Error::UnknownRecordVersion`] without touching the record.

use crate::error::{Error, Result};
use crate::records::{Alias, Capture};

// =============================================================================
// Namespaces
// =============================================================================

pub const NS_CAPTURE: u8 = 0x01;
pub const NS_ALIAS: u8 = 0x02;
pub const NS_RULE: u8 = 0x03;
pub const NS_POLICY: u8 = 0x04;
pub const NS_META: u8 = 0x05;

/// Capture value layout holding the CDX11 fields.
const VALUE_V1: u8 = 1;
/// Capture value layout with the CDX14 `original_*` locator fields.
const VALUE_V2: u8 = 2;
/// Alias value layout.
const ALIAS_V1: u8 = 1;
/// Write-batch blob layout.
const BATCH_V1: u8 = 1;

// =============================================================================
// Escaped Components
// =============================================================================

/// Appends a variable-length key component: `0x00` bytes escaped as
/// `0x00 0xFF`, then a single `0x00` terminator.
fn push_component(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        out.push(b);
        if b == 0x00 {
            out.push(0xFF);
        }
    }
    out.push(0x00);
}

/// Reads one escaped component starting at `pos`, returning the decoded
/// bytes and the position just past the terminator.
fn read_component(key: &[u8], mut pos: usize) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    loop {
        match key.get(pos) {
            Some(&0x00) => match key.get(pos + 1) {
                Some(&0xFF) => {
                    out.push(0x00);
                    pos += 2;
                }
                _ => return Ok((out, pos + 1)),
            },
            Some(&b) => {
                out.push(b);
                pos += 1;
            }
            None => return Err(Error::Corrupt("unterminated key component".to_string())),
        }
    }
}

fn read_u64_be(key: &[u8], pos: usize) -> Result<(u64, usize)> {
    let bytes: [u8; 8] = key
        .get(pos..pos + 8)
        .ok_or_else(|| Error::Corrupt("truncated key".to_string()))?
        .try_into()
        .expect("slice length checked");
    Ok((u64::from_be_bytes(bytes), pos + 8))
}

// =============================================================================
// Capture Keys
// =============================================================================

/// Encodes the primary key of a capture.
pub fn capture_key(capture: &Capture) -> Vec<u8> {
    let mut key = Vec::with_capacity(capture.urlkey.len() + capture.filename.len() + 20);
    key.push(NS_CAPTURE);
    push_component(&mut key, capture.urlkey.as_bytes());
    key.extend_from_slice(&capture.timestamp.to_be_bytes());
    push_component(&mut key, capture.filename.as_bytes());
    key.extend_from_slice(&capture.offset.to_be_bytes());
    key
}

/// Scan prefix matching captures whose urlkey starts with `urlkey_prefix`
/// (prefix, host, and domain queries).
pub fn capture_key_prefix(urlkey_prefix: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(urlkey_prefix.len() + 1);
    key.push(NS_CAPTURE);
    for &b in urlkey_prefix.as_bytes() {
        key.push(b);
        if b == 0x00 {
            key.push(0xFF);
        }
    }
    key
}

/// Scan prefix matching exactly one urlkey.
///
/// The trailing `0x00 0x00` is the component terminator plus the first
/// big-endian timestamp byte, which is always zero for 14-digit timestamps;
/// together they exclude urlkeys that merely extend this one.
pub fn capture_key_prefix_exact(urlkey: &str) -> Vec<u8> {
    let mut key = capture_key_prefix(urlkey);
    key.push(0x00);
    key.push(0x00);
    key
}

/// Anchor key for positioning a scan at `(urlkey, timestamp)`, before any
/// capture of that timestamp.
pub fn capture_key_at(urlkey: &str, timestamp: u64) -> Vec<u8> {
    let mut key = capture_key_prefix(urlkey);
    key.push(0x00);
    key.extend_from_slice(&timestamp.to_be_bytes());
    key
}

/// Smallest key strictly greater than every key starting with `prefix`, or
/// `None` when the prefix is all `0xFF` and no such key exists.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut succ = prefix.to_vec();
    while let Some(&last) = succ.last() {
        if last == 0xFF {
            succ.pop();
        } else {
            *succ.last_mut().expect("nonempty") = last + 1;
            return Some(succ);
        }
    }
    None
}

// =============================================================================
// Capture Values
// =============================================================================

/// Encodes a capture into its `(key, value)` pair.
pub fn encode_capture(capture: &Capture) -> (Vec<u8>, Vec<u8>) {
    let cdx14 = capture.original_length.is_some()
        || capture.original_offset.is_some()
        || capture.original_filename.is_some();

    let mut value = Vec::with_capacity(64);
    value.push(if cdx14 { VALUE_V2 } else { VALUE_V1 });
    write_str(&mut value, &capture.original_url);
    write_str(&mut value, &capture.mimetype);
    value.extend_from_slice(&capture.status.to_le_bytes());
    write_str(&mut value, &capture.digest);
    write_str(&mut value, &capture.redirecturl);
    write_str(&mut value, &capture.robotflags);
    value.extend_from_slice(&capture.length.to_le_bytes());
    if cdx14 {
        write_opt_u64(&mut value, capture.original_length);
        write_opt_u64(&mut value, capture.original_offset);
        write_opt_str(&mut value, capture.original_filename.as_deref());
    }

    (capture_key(capture), value)
}

/// Decodes a capture from its stored `(key, value)` pair.
///
/// # Errors
///
/// [`Error::UnknownRecordVersion`] when the value was written by a newer
/// codec; [`Error::Corrupt`] on truncation or a wrong namespace byte.
pub fn decode_capture(key: &[u8], value: &[u8]) -> Result<Capture> {
    if key.first() != Some(&NS_CAPTURE) {
        return Err(Error::Corrupt("not a capture key".to_string()));
    }
    let (urlkey, pos) = read_component(key, 1)?;
    let (timestamp, pos) = read_u64_be(key, pos)?;
    let (filename, pos) = read_component(key, pos)?;
    let (offset, pos) = read_u64_be(key, pos)?;
    if pos != key.len() {
        return Err(Error::Corrupt("trailing bytes in capture key".to_string()));
    }

    let mut cursor = Cursor::new(value);
    let version = cursor.read_u8()?;
    if version != VALUE_V1 && version != VALUE_V2 {
        return Err(Error::UnknownRecordVersion { version });
    }

    let original_url = cursor.read_string()?;
    let mimetype = cursor.read_string()?;
    let status = cursor.read_u16()?;
    let digest = cursor.read_string()?;
    let redirecturl = cursor.read_string()?;
    let robotflags = cursor.read_string()?;
    let length = cursor.read_u64()?;

    let (original_length, original_offset, original_filename) = if version == VALUE_V2 {
        (
            cursor.read_opt_u64()?,
            cursor.read_opt_u64()?,
            cursor.read_opt_string()?,
        )
    } else {
        (None, None, None)
    };

    Ok(Capture {
        urlkey: into_string(urlkey)?,
        timestamp,
        original_url,
        mimetype,
        status,
        digest,
        redirecturl,
        robotflags,
        length,
        offset,
        filename: into_string(filename)?,
        original_length,
        original_offset,
        original_filename,
    })
}

// =============================================================================
// Alias Records
// =============================================================================

/// Encodes the key of an alias record.
pub fn alias_key(alias_surt: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(alias_surt.len() + 2);
    key.push(NS_ALIAS);
    push_component(&mut key, alias_surt.as_bytes());
    key
}

/// Scan prefix for alias listings.
pub fn alias_key_prefix(surt_prefix: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(surt_prefix.len() + 1);
    key.push(NS_ALIAS);
    key.extend_from_slice(surt_prefix.as_bytes());
    key
}

/// Encodes an alias into its `(key, value)` pair.
pub fn encode_alias(alias: &Alias) -> (Vec<u8>, Vec<u8>) {
    let mut value = Vec::with_capacity(alias.target.len() + 5);
    value.push(ALIAS_V1);
    write_str(&mut value, &alias.target);
    (alias_key(&alias.alias), value)
}

/// Decodes an alias from its stored `(key, value)` pair.
pub fn decode_alias(key: &[u8], value: &[u8]) -> Result<Alias> {
    if key.first() != Some(&NS_ALIAS) {
        return Err(Error::Corrupt("not an alias key".to_string()));
    }
    let (alias, pos) = read_component(key, 1)?;
    if pos != key.len() {
        return Err(Error::Corrupt("trailing bytes in alias key".to_string()));
    }
    let mut cursor = Cursor::new(value);
    let version = cursor.read_u8()?;
    if version != ALIAS_V1 {
        return Err(Error::UnknownRecordVersion { version });
    }
    Ok(Alias {
        alias: into_string(alias)?,
        target: cursor.read_string()?,
    })
}

// =============================================================================
// Rule / Policy / Meta Keys
// =============================================================================

pub fn rule_key(id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(NS_RULE);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

pub fn policy_key(id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(NS_POLICY);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

pub fn meta_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 1);
    key.push(NS_META);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Extracts the id from a rule or policy key.
pub fn id_from_key(key: &[u8]) -> Result<u64> {
    let (id, pos) = read_u64_be(key, 1)?;
    if pos != key.len() {
        return Err(Error::Corrupt("trailing bytes in id key".to_string()));
    }
    Ok(id)
}

// =============================================================================
// Write-Batch Blobs
// =============================================================================

/// One staged mutation inside a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    /// Bytes this op contributes to a batch's staged size.
    pub fn staged_size(&self) -> usize {
        match self {
            BatchOp::Put { key, value } => key.len() + value.len(),
            BatchOp::Delete { key } => key.len(),
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

/// Serializes a batch's ops into the opaque blob shipped over the change
/// feed. The trailing eight bytes are an XXH3-64 of everything before them.
pub fn encode_batch_ops(ops: &[BatchOp]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32 * ops.len());
    blob.push(BATCH_V1);
    blob.extend_from_slice(&(ops.len() as u32).to_le_bytes());
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                blob.push(1);
                write_bytes(&mut blob, key);
                write_bytes(&mut blob, value);
            }
            BatchOp::Delete { key } => {
                blob.push(2);
                write_bytes(&mut blob, key);
            }
        }
    }
    let checksum = xxhash_rust::xxh3::xxh3_64(&blob);
    blob.extend_from_slice(&checksum.to_le_bytes());
    blob
}

/// Deserializes and verifies a write-batch blob.
///
/// Only blobs produced by [`encode_batch_ops`] apply cleanly; cross-engine
/// replication is not a thing.
pub fn decode_batch_ops(blob: &[u8]) -> Result<Vec<BatchOp>> {
    if blob.len() < 13 {
        return Err(Error::Corrupt("write batch too short".to_string()));
    }
    let (body, checksum_bytes) = blob.split_at(blob.len() - 8);
    let expected = u64::from_le_bytes(checksum_bytes.try_into().expect("8 bytes"));
    let actual = xxhash_rust::xxh3::xxh3_64(body);
    if expected != actual {
        return Err(Error::Corrupt(format!(
            "write batch checksum mismatch: stored {expected:016x}, computed {actual:016x}"
        )));
    }

    let mut cursor = Cursor::new(body);
    let version = cursor.read_u8()?;
    if version != BATCH_V1 {
        return Err(Error::UnknownRecordVersion { version });
    }
    let count = cursor.read_u32()? as usize;
    let mut ops = Vec::with_capacity(count);
    for _ in 0..count {
        match cursor.read_u8()? {
            1 => ops.push(BatchOp::Put {
                key: cursor.read_bytes()?,
                value: cursor.read_bytes()?,
            }),
            2 => ops.push(BatchOp::Delete {
                key: cursor.read_bytes()?,
            }),
            tag => return Err(Error::Corrupt(format!("unknown batch op tag {tag}"))),
        }
    }
    if !cursor.at_end() {
        return Err(Error::Corrupt("trailing bytes in write batch".to_string()));
    }
    Ok(ops)
}

// =============================================================================
// Little-Endian Field Helpers
// =============================================================================

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_bytes(out, s.as_bytes());
}

fn write_opt_u64(out: &mut Vec<u8>, value: Option<u64>) {
    match value {
        Some(v) => {
            out.push(1);
            out.extend_from_slice(&v.to_le_bytes());
        }
        None => out.push(0),
    }
}

fn write_opt_str(out: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(v) => {
            out.push(1);
            write_str(out, v);
        }
        None => out.push(0),
    }
}

fn into_string(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| Error::Corrupt(format!("invalid UTF-8 in key: {e}")))
}

/// Bounds-checked reader over a stored value.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| Error::Corrupt("truncated value".to_string()))?;
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| Error::Corrupt(format!("invalid UTF-8 in value: {e}")))
    }

    fn read_opt_u64(&mut self) -> Result<Option<u64>> {
        match self.read_u8()? {
            0 => Ok(None),
            _ => Ok(Some(self.read_u64()?)),
        }
    }

    fn read_opt_string(&mut self) -> Result<Option<String>> {
        match self.read_u8()? {
            0 => Ok(None),
            _ => Ok(Some(self.read_string()?)),
        }
    }

    fn at_end(&self) -> bool {
        self.pos == self.data.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
