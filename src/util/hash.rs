//! Hashing utilities for content addressing.
//!
//! Every digest is a lowercase hex sha256.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::util::filter::FileFilter;

const BLOCK_SIZE: usize = 64 * 1024;

/// Compute SHA256 hash of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute SHA256 hash of a string.
pub fn sha256_str(s: &str) -> String {
    sha256_bytes(s.as_bytes())
}

/// Compute SHA256 hash of a file, reading it in 64 KiB blocks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;

    let mut reader = BufReader::with_capacity(BLOCK_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BLOCK_SIZE];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .with_context(|| format!("failed to read file: {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash a directory's filtered file set.
///
/// Files are visited in sorted POSIX-relative order; for each one the
/// relative path bytes and then the hex digest of its content are fed into
/// a single sha256.
pub fn hash_dir(root: &Path, filter: &FileFilter) -> Result<String> {
    let files = filter.files(root)?;
    let mut hasher = Sha256::new();

    for rel in &files {
        let digest = sha256_file(&root.join(rel))?;
        hasher.update(rel.as_bytes());
        hasher.update(digest.as_bytes());
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash a URL by its network location and non-empty path segments.
///
/// Scheme, query, fragment and trailing slashes do not affect the result,
/// so `https://host/a/` and `http://host/a` hash the same.
pub fn hash_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url).with_context(|| format!("invalid URL: {}", url))?;

    let mut netloc = parsed.host_str().unwrap_or_default().to_string();
    if let Some(port) = parsed.port() {
        netloc.push_str(&format!(":{}", port));
    }

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|segs| segs.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let mut key = netloc;
    for segment in segments {
        key.push('/');
        key.push_str(segment);
    }

    Ok(sha256_str(&key))
}

/// Hash a serializable value as compact JSON with sorted keys.
pub fn hash_object<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(sha256_str(&canonical_json(value)?))
}

/// Compact JSON with object keys in sorted order.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    // `serde_json::Value` keeps object keys in a BTreeMap.
    let value = serde_json::to_value(value).context("failed to serialize value for hashing")?;
    serde_json::to_string(&value).context("failed to serialize value for hashing")
}
