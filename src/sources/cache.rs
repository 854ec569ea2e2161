//! Shared on-disk component cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! .lock                                   cross-process write lock
//! .version_check                          timestamp of the last new-version check
//! <hash_key>/<ns__name>_<version>_<hash8> unpacked artifact + CHECKSUMS.json
//! git~<hash_key>/                         git working copy of a repository
//! ```
//!
//! Entries are validated before every reuse. A failed validation is a cache
//! miss, never an error.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use anyhow::{Context, Result};
use fs2::FileExt;

use crate::core::manifest::component_filter;
use crate::core::name::build_name;
use crate::core::version::Version;
use crate::util::checksums::{validate_dir, write_integrity};
use crate::util::fs::{ensure_dir, remove_dir_all_if_exists, replace_dir};
use crate::util::hash::hash_dir;

const LOCK_FILENAME: &str = ".lock";

/// An exclusive lock on the cache, shared safely across processes and
/// threads. Released on drop.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    // fs2 locks are per process on Unix; the mutex excludes other threads.
    _guard: MutexGuard<'static, ()>,
}

impl CacheLock {
    /// Block until the lock at `path` is held.
    pub fn lock_exclusive(path: &Path) -> Result<Self> {
        let mutex = process_lock_for_path(path);
        let guard = mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open cache lock {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;

        Ok(CacheLock {
            file,
            _guard: guard,
        })
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn process_lock_for_path(path: &Path) -> &'static Mutex<()> {
    static PROCESS_LOCKS: OnceLock<Mutex<HashMap<PathBuf, &'static Mutex<()>>>> = OnceLock::new();
    let locks = PROCESS_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));

    let mut map = locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = map.get(path) {
        return existing;
    }

    let mutex: &'static Mutex<()> = Box::leak(Box::new(Mutex::new(())));
    map.insert(path.to_path_buf(), mutex);
    mutex
}

/// Handle to the cache root.
#[derive(Debug, Clone)]
pub struct ComponentCache {
    root: PathBuf,
}

impl ComponentCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ComponentCache { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Take the cache write lock.
    pub fn lock(&self) -> Result<CacheLock> {
        CacheLock::lock_exclusive(&self.root.join(LOCK_FILENAME))
    }

    /// Directory of one artifact: `<hash_key>/<ns__name>_<version>_<hash8>`.
    pub fn entry_path(
        &self,
        hash_key: &str,
        name: &str,
        version: &Version,
        component_hash: Option<&str>,
    ) -> PathBuf {
        let mut dir = format!("{}_{}", build_name(name), version);
        if let Some(hash) = component_hash {
            dir.push('_');
            dir.push_str(&hash[..hash.len().min(8)]);
        }
        self.root.join(hash_key).join(dir)
    }

    /// Working copy of a git repository.
    pub fn git_repo_path(&self, hash_key: &str) -> PathBuf {
        self.root.join(format!("git~{}", hash_key))
    }

    /// Return `entry` if it exists and its content still matches.
    ///
    /// With an expected hash the recomputed directory hash decides; without
    /// one the entry's own integrity metadata does.
    pub fn lookup(&self, entry: &Path, expected_hash: Option<&str>) -> Option<PathBuf> {
        if !entry.is_dir() {
            return None;
        }

        let Ok(filter) = component_filter(entry) else {
            tracing::warn!("cached component at {} has an unreadable manifest", entry.display());
            return None;
        };
        let valid = match expected_hash {
            Some(expected) => matches!(hash_dir(entry, &filter), Ok(actual) if actual == expected),
            None => validate_dir(entry, &filter, None).is_ok(),
        };

        if valid {
            tracing::debug!("cache hit: {}", entry.display());
            Some(entry.to_path_buf())
        } else {
            tracing::warn!(
                "cached component at {} failed validation; downloading again",
                entry.display()
            );
            None
        }
    }

    /// Create a staging directory next to where entries for `hash_key` live.
    pub fn staging_dir(&self, hash_key: &str) -> Result<tempfile::TempDir> {
        let parent = self.root.join(hash_key);
        ensure_dir(&parent)?;
        tempfile::Builder::new()
            .prefix(".download-")
            .tempdir_in(&parent)
            .with_context(|| format!("failed to create staging directory in {}", parent.display()))
    }

    /// Move verified content into `entry`, writing its integrity metadata.
    pub fn store(&self, content: &Path, entry: &Path) -> Result<()> {
        let _lock = self.lock()?;
        replace_dir(content, entry)?;
        write_integrity(entry, &component_filter(entry)?)?;
        tracing::debug!("cached {}", entry.display());
        Ok(())
    }

    /// Delete everything in the cache.
    pub fn clear(&self) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        let _lock = self.lock()?;
        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("failed to read {}", self.root.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if entry.file_name() == LOCK_FILENAME {
                continue;
            }
            if entry.file_type()?.is_dir() {
                remove_dir_all_if_exists(&path)?;
            } else {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
            }
        }
        tracing::info!("cleared component cache at {}", self.root.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sample(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("cmp.c"), "int x;").unwrap();
    }

    #[test]
    fn test_entry_path_layout() {
        let cache = ComponentCache::new("/cache");
        let path = cache.entry_path(
            "abc",
            "ex/cmp",
            &Version::parse("3.3.7").unwrap(),
            Some("0123456789abcdef"),
        );
        assert_eq!(path, PathBuf::from("/cache/abc/ex__cmp_3.3.7_01234567"));
        assert_eq!(cache.git_repo_path("k"), PathBuf::from("/cache/git~k"));
    }

    #[test]
    fn test_store_and_lookup() {
        let tmp = TempDir::new().unwrap();
        let cache = ComponentCache::new(tmp.path().join("cache"));
        let staged = tmp.path().join("staged");
        sample(&staged);
        let hash = hash_dir(&staged, &component_filter(&staged).unwrap()).unwrap();

        let entry = cache.entry_path("key", "ex/cmp", &Version::parse("1.0.0").unwrap(), Some(&hash));
        assert!(cache.lookup(&entry, Some(&hash)).is_none());

        cache.store(&staged, &entry).unwrap();
        assert_eq!(cache.lookup(&entry, Some(&hash)), Some(entry.clone()));
        assert!(cache.lookup(&entry, None).is_some());
        assert!(cache.lookup(&entry, Some("deadbeef")).is_none());
    }

    #[test]
    fn test_tampered_entry_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = ComponentCache::new(tmp.path().join("cache"));
        let staged = tmp.path().join("staged");
        sample(&staged);
        let entry = tmp.path().join("cache/key/entry");
        cache.store(&staged, &entry).unwrap();

        fs::write(entry.join("cmp.c"), "int y;").unwrap();
        assert!(cache.lookup(&entry, None).is_none());
    }

    #[test]
    fn test_clear_keeps_lock_file() {
        let tmp = TempDir::new().unwrap();
        let cache = ComponentCache::new(tmp.path());
        sample(&tmp.path().join("key/entry"));
        fs::write(tmp.path().join(".version_check"), "0").unwrap();
        drop(cache.lock().unwrap());

        cache.clear().unwrap();

        let left: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(left, vec![std::ffi::OsString::from(LOCK_FILENAME)]);
    }
}
