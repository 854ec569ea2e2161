//! Periodic check for newer versions of direct dependencies.
//!
//! At most once per [`CHECK_INTERVAL`]; the time of the last check is
//! stored in `<cache>/.version_check` as unix seconds.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::core::version::{Version, VersionSpec};
use crate::resolver::Resolve;
use crate::sources::SourceMap;
use crate::util::fs::atomic_write;

pub const VERSION_CHECK_FILENAME: &str = ".version_check";

pub const CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Warnings about newer compatible versions, if a check is due.
///
/// Failures never abort the caller; they are logged and skipped.
pub fn check(sources: &SourceMap, resolve: &Resolve, cache_root: &Path) -> Vec<String> {
    let now = SystemTime::now();
    if !is_due(cache_root, now) {
        tracing::debug!("skipping version check, last one was less than a day ago");
        return Vec::new();
    }

    let warnings = newer_versions(sources, resolve);
    if let Err(err) = mark_checked(cache_root, now) {
        tracing::debug!("failed to record version check: {:#}", err);
    }
    warnings
}

/// Whether the last recorded check is older than [`CHECK_INTERVAL`].
pub fn is_due(cache_root: &Path, now: SystemTime) -> bool {
    let Ok(content) = std::fs::read_to_string(cache_root.join(VERSION_CHECK_FILENAME)) else {
        return true;
    };
    let Ok(secs) = content.trim().parse::<u64>() else {
        return true;
    };
    let last = UNIX_EPOCH + Duration::from_secs(secs);
    match now.duration_since(last) {
        Ok(elapsed) => elapsed >= CHECK_INTERVAL,
        // Clock went backwards
        Err(_) => true,
    }
}

pub fn mark_checked(cache_root: &Path, now: SystemTime) -> anyhow::Result<()> {
    let secs = now.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    crate::util::fs::ensure_dir(cache_root)?;
    atomic_write(
        &cache_root.join(VERSION_CHECK_FILENAME),
        secs.to_string().as_bytes(),
    )
}

/// Compare each direct registry dependency with the newest stable version
/// that is caret-compatible with the selected one.
pub fn newer_versions(sources: &SourceMap, resolve: &Resolve) -> Vec<String> {
    let target = sources.build_context().target.clone();
    let mut warnings = Vec::new();

    for name in resolve.direct_dependencies() {
        let Some(component) = resolve.get(name) else {
            continue;
        };
        let Version::Semver(current) = &component.version else {
            continue;
        };
        if !component.source.is_registry() {
            continue;
        }

        let Ok(spec) = VersionSpec::parse(&format!("^{}", current)) else {
            continue;
        };
        let listing = sources
            .get_or_create(&component.source)
            .and_then(|source| source.versions(name, &spec, Some(&target)));
        let listing = match listing {
            Ok(listing) => listing,
            Err(err) => {
                tracing::debug!("version check for `{}` failed: {:#}", name, err);
                continue;
            }
        };

        let newest = listing
            .versions
            .iter()
            .map(|v| v.version())
            .filter(|v| !v.is_prerelease())
            .filter_map(|v| v.semver())
            .filter(|v| *v > current)
            .max();
        if let Some(newest) = newest {
            warnings.push(format!(
                "a newer version of `{}` is available: {} (using {})",
                name, newest, current
            ));
        }
    }
    warnings
}
