//! Integrity metadata for materialized components.
//!
//! A component directory carries a legacy `.component_hash` (hex digest of
//! the filtered directory) and/or a per-file `CHECKSUMS.json` manifest.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::errors::ErrorKind;
use crate::util::filter::FileFilter;
use crate::util::fs::atomic_write;
use crate::util::hash::{hash_dir, sha256_file};

pub const COMPONENT_HASH_FILENAME: &str = ".component_hash";
pub const CHECKSUMS_FILENAME: &str = "CHECKSUMS.json";

const CHECKSUMS_VERSION: &str = "1.0";
const CHECKSUMS_ALGORITHM: &str = "sha256";

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("no integrity metadata found in {}", .dir.display())]
    HashNotFound { dir: PathBuf },

    #[error("directory hash mismatch for {}: expected {expected}, found {actual}", .dir.display())]
    HashMismatch {
        dir: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("file `{file}` in {} does not match its recorded checksum", .dir.display())]
    FileModified { dir: PathBuf, file: String },

    #[error("file `{file}` listed in {} checksums is missing", .dir.display())]
    FileMissing { dir: PathBuf, file: String },

    #[error("file `{file}` in {} is not listed in its checksums", .dir.display())]
    FileUnlisted { dir: PathBuf, file: String },

    #[error("malformed CHECKSUMS.json in {}: {reason}", .dir.display())]
    Malformed { dir: PathBuf, reason: String },
}

impl IntegrityError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Integrity
    }

    /// The offending file, when the failure is tied to one.
    pub fn file(&self) -> Option<&str> {
        match self {
            IntegrityError::FileModified { file, .. }
            | IntegrityError::FileMissing { file, .. }
            | IntegrityError::FileUnlisted { file, .. } => Some(file),
            _ => None,
        }
    }

    /// Whether the directory had no metadata at all, as opposed to a proven
    /// mismatch.
    pub fn is_missing_metadata(&self) -> bool {
        matches!(self, IntegrityError::HashNotFound { .. })
    }
}

/// One entry of `CHECKSUMS.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChecksum {
    pub path: String,
    pub size: u64,
    pub hash: String,
}

/// The `CHECKSUMS.json` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumsManifest {
    pub version: String,
    pub algorithm: String,
    pub created_at: String,
    pub files: Vec<FileChecksum>,
}

impl ChecksumsManifest {
    /// Build checksums for the filtered files of `dir`.
    pub fn compute(dir: &Path, filter: &FileFilter) -> Result<Self> {
        let mut files = Vec::new();
        for rel in filter.files(dir)? {
            let path = dir.join(&rel);
            let size = fs::metadata(&path)
                .with_context(|| format!("failed to stat {}", path.display()))?
                .len();
            files.push(FileChecksum {
                hash: sha256_file(&path)?,
                path: rel,
                size,
            });
        }

        Ok(ChecksumsManifest {
            version: CHECKSUMS_VERSION.to_string(),
            algorithm: CHECKSUMS_ALGORITHM.to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            files,
        })
    }

    pub fn parse(dir: &Path, content: &str) -> Result<Self, IntegrityError> {
        let manifest: ChecksumsManifest =
            serde_json::from_str(content).map_err(|e| IntegrityError::Malformed {
                dir: dir.to_path_buf(),
                reason: e.to_string(),
            })?;
        if manifest.algorithm != CHECKSUMS_ALGORITHM {
            return Err(IntegrityError::Malformed {
                dir: dir.to_path_buf(),
                reason: format!("unsupported algorithm `{}`", manifest.algorithm),
            });
        }
        Ok(manifest)
    }

    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(CHECKSUMS_FILENAME);
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Some(Self::parse(dir, &content)?))
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        atomic_write(&dir.join(CHECKSUMS_FILENAME), content.as_bytes())
    }

    /// Check every listed file and report files the filter selects that
    /// are not listed.
    pub fn verify(&self, dir: &Path, filter: &FileFilter) -> Result<()> {
        let listed: BTreeMap<&str, &FileChecksum> =
            self.files.iter().map(|f| (f.path.as_str(), f)).collect();

        for (rel, entry) in &listed {
            let path = dir.join(rel);
            let meta = match fs::metadata(&path) {
                Ok(meta) if meta.is_file() => meta,
                _ => {
                    return Err(IntegrityError::FileMissing {
                        dir: dir.to_path_buf(),
                        file: rel.to_string(),
                    }
                    .into())
                }
            };
            if meta.len() != entry.size || sha256_file(&path)? != entry.hash {
                return Err(IntegrityError::FileModified {
                    dir: dir.to_path_buf(),
                    file: rel.to_string(),
                }
                .into());
            }
        }

        for rel in filter.files(dir)? {
            if !listed.contains_key(rel.as_str()) {
                return Err(IntegrityError::FileUnlisted {
                    dir: dir.to_path_buf(),
                    file: rel,
                }
                .into());
            }
        }

        Ok(())
    }
}

/// Read `.component_hash`, if present.
pub fn read_component_hash(dir: &Path) -> Result<Option<String>> {
    let path = dir.join(COMPONENT_HASH_FILENAME);
    if !path.is_file() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Some(content.trim().to_string()))
}

pub fn write_component_hash(dir: &Path, hash: &str) -> Result<()> {
    atomic_write(&dir.join(COMPONENT_HASH_FILENAME), hash.as_bytes())
}

/// Whether `dir` carries any integrity metadata.
pub fn has_metadata(dir: &Path) -> bool {
    dir.join(CHECKSUMS_FILENAME).is_file() || dir.join(COMPONENT_HASH_FILENAME).is_file()
}

/// Validate a directory against its integrity metadata.
///
/// `CHECKSUMS.json` wins over `.component_hash`. When only the latter
/// exists the directory hash is recomputed and compared both with the file
/// and, when given, with `expected_hash`.
pub fn validate_dir(dir: &Path, filter: &FileFilter, expected_hash: Option<&str>) -> Result<()> {
    if let Some(manifest) = ChecksumsManifest::load(dir)? {
        manifest.verify(dir, filter)?;
        if let (Some(expected), Some(stored)) = (expected_hash, read_component_hash(dir)?) {
            if stored != expected {
                return Err(IntegrityError::HashMismatch {
                    dir: dir.to_path_buf(),
                    expected: expected.to_string(),
                    actual: stored,
                }
                .into());
            }
        }
        return Ok(());
    }

    let Some(stored) = read_component_hash(dir)? else {
        return Err(IntegrityError::HashNotFound {
            dir: dir.to_path_buf(),
        }
        .into());
    };

    let actual = hash_dir(dir, filter)?;
    let expected = expected_hash.unwrap_or(&stored);
    if actual != stored || actual != expected {
        return Err(IntegrityError::HashMismatch {
            dir: dir.to_path_buf(),
            expected: expected.to_string(),
            actual,
        }
        .into());
    }
    Ok(())
}

/// Compute and write both metadata files, returning the directory hash.
pub fn write_integrity(dir: &Path, filter: &FileFilter) -> Result<String> {
    let hash = hash_dir(dir, filter)?;
    ChecksumsManifest::compute(dir, filter)?.write(dir)?;
    write_component_hash(dir, &hash)?;
    tracing::debug!("wrote integrity metadata for {}", dir.display());
    Ok(hash)
}
