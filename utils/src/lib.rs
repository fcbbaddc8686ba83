//! # Strata Utilities
//!
//! Common helpers for content hashing, gzip payloads, dotted key paths and
//! id generation.
//!
//! Canonical serialization relies on `serde_json::Map` being ordered by key
//! (the `preserve_order` feature is never enabled in this workspace), so two
//! equal values always serialize to the same bytes.

pub mod keypath;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use uuid::Uuid;

pub use keypath::{lookup, remove_path, set_path};

/// Compute SHA-256 hash of content string
///
/// # Examples
///
/// ```
/// use utils::compute_content_hash;
///
/// let hash = compute_content_hash("hello world");
/// assert_eq!(hash.len(), 64);
/// ```
#[must_use]
pub fn compute_content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hex SHA-256 of raw bytes, used as the checksum of compressed payloads.
#[must_use]
pub fn compute_checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Compact JSON with keys in sorted order.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Content hash of a configuration value over its canonical serialization.
#[must_use]
pub fn hash_value(value: &Value) -> String {
    compute_content_hash(&canonical_json(value))
}

pub fn gzip_compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn gzip_decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    tracing::trace!(compressed = data.len(), inflated = out.len(), "gzip payload decoded");
    Ok(out)
}

/// Generate UUID v4 string
#[must_use]
pub fn generate_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// First eight hex characters of a fresh UUID.
#[must_use]
pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
