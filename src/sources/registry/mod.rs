//! Registry source - components from a component registry.
//!
//! The registry is queried over HTTP (see [`client`]). Downloaded archives
//! are unpacked and verified into the shared cache, then copied to the
//! requested location.
//!
//! # Cache layout
//!
//! ```text
//! <cache>/<sha256(registry url)>/<ns__name>_<version>_<hash8>/
//! ```

pub mod archive;
pub mod client;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::core::dependency::{Requirement, RuleSpec};
use crate::core::manifest::{component_filter, ManifestError};
use crate::core::name::{self, TOOLCHAIN_NAME};
use crate::core::rules::Rule;
use crate::core::source_id::SourceRef;
use crate::core::summary::{ComponentVersion, ComponentWithVersions};
use crate::core::version::{Version, VersionSpec};
use crate::resolver::ResolvedComponent;
use crate::sources::cache::ComponentCache;
use crate::util::checksums::{ChecksumsManifest, IntegrityError};
use crate::util::config::EnvConfig;
use crate::util::hash::{hash_dir, hash_url};

pub use archive::{ArchiveError, ArchiveKind};
pub use client::{RegistryClient, RegistryError, VersionResponse};

/// A source for registry dependencies.
#[derive(Debug)]
pub struct RegistrySource {
    source_ref: SourceRef,
    url: String,
    client: RegistryClient,
    cache: ComponentCache,
    namespace: String,

    /// Component listings fetched this session, by full name
    listings: Mutex<HashMap<String, Arc<client::ComponentResponse>>>,
}

impl RegistrySource {
    pub fn new(source_ref: SourceRef, cache: ComponentCache, env: &EnvConfig) -> Result<Self> {
        let SourceRef::Registry { url, .. } = &source_ref else {
            anyhow::bail!("not a registry source: {}", source_ref);
        };
        let url = url.clone();
        let client = RegistryClient::new(&url, env.storage_url(), env.api_token())?;

        Ok(RegistrySource {
            source_ref,
            url,
            client,
            cache,
            namespace: env.namespace().to_string(),
            listings: Mutex::new(HashMap::new()),
        })
    }

    pub fn source_ref(&self) -> &SourceRef {
        &self.source_ref
    }

    /// sha256 of the normalized registry URL.
    pub fn hash_key(&self) -> String {
        hash_url(&self.url).unwrap_or_else(|_| crate::util::hash::sha256_str(&self.url))
    }

    /// Where the unpacked artifact of `name` at `version` lives in the cache.
    pub fn component_cache_path(&self, name: &str, version: &Version, hash: Option<&str>) -> PathBuf {
        self.cache.entry_path(&self.hash_key(), name, version, hash)
    }

    /// Versions of `name` that match `spec` and support `target`.
    ///
    /// Pre-release versions are kept; the solver gates them.
    pub fn versions(
        &self,
        full_name: &str,
        spec: &VersionSpec,
        target: Option<&str>,
    ) -> Result<ComponentWithVersions> {
        let listing = self.listing(full_name)?;
        let mut result = ComponentWithVersions::new(full_name, Vec::new());
        let tool = tool_version();

        for info in &listing.versions {
            let version = match Version::parse(&info.version) {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!("skipping {} {}: {}", full_name, info.version, e);
                    continue;
                }
            };
            if info.yanked {
                result
                    .diagnostics
                    .push(format!("{} was yanked", version));
                continue;
            }
            if !spec.matches_with(&version, true) {
                continue;
            }
            if let Some(required) = &info.min_component_manager_version {
                match semver::Version::parse(required) {
                    Ok(required) if required > tool => {
                        result.diagnostics.push(format!(
                            "{} requires component manager {} or newer (this is {})",
                            version, required, tool
                        ));
                        continue;
                    }
                    Ok(_) => {}
                    Err(_) => {
                        tracing::debug!(
                            "ignoring malformed min_component_manager_version `{}` of {} {}",
                            required,
                            full_name,
                            version
                        );
                    }
                }
            }

            let targets: Vec<String> = info.targets.iter().map(|t| t.to_lowercase()).collect();
            if let Some(target) = target {
                if !targets.is_empty() && !targets.iter().any(|t| t == target) {
                    result.reject_target(&version, &targets);
                    continue;
                }
            }

            let dependencies = match self.dependencies(full_name, &info.dependencies) {
                Ok(deps) => deps,
                Err(e) => {
                    result
                        .diagnostics
                        .push(format!("{} has an invalid dependency: {}", version, e));
                    continue;
                }
            };

            let mut candidate = ComponentVersion::new(version, dependencies)
                .with_hash(info.component_hash.clone())
                .with_targets(targets);
            if let Some(url) = &info.download_url {
                candidate = candidate.with_download(url.clone(), info.checksums_url.clone());
            }
            result.versions.push(candidate);
        }

        tracing::debug!(
            "registry offers {} version(s) of {}",
            result.versions.len(),
            full_name
        );
        Ok(result)
    }

    /// Place the verified artifact of `resolved` at `dest`.
    pub fn fetch(&self, resolved: &ResolvedComponent, dest: &Path) -> Result<PathBuf> {
        let entry = self.component_cache_path(
            &resolved.name,
            &resolved.version,
            resolved.component_hash.as_deref(),
        );

        let cached = match self.cache.lookup(&entry, resolved.component_hash.as_deref()) {
            Some(path) => path,
            None => self.download(resolved, &entry)?,
        };

        crate::util::fs::replace_dir(&cached, dest)
            .with_context(|| format!("failed to materialize {} at {}", resolved.name, dest.display()))?;
        Ok(dest.to_path_buf())
    }

    fn download(&self, resolved: &ResolvedComponent, entry: &Path) -> Result<PathBuf> {
        let version = resolved.version.to_string();
        let info = self.client.version(&resolved.name, &version)?;
        let download_url = info.download_url.as_deref().ok_or_else(|| {
            RegistryError::InvalidResponse {
                endpoint: self.client.api_url().to_string(),
                message: format!("no download URL for {} {}", resolved.name, version),
            }
        })?;

        let staging = self.cache.staging_dir(&self.hash_key())?;
        let (archive_path, kind) = self.client.download_archive(download_url, staging.path())?;
        let content = staging.path().join("content");
        archive::extract(&archive_path, kind, &content)?;

        let filter = component_filter(&content)?;
        if let Some(checksums_url) = &info.checksums_url {
            let body = self.client.download_checksums(checksums_url)?;
            ChecksumsManifest::parse(&content, &body)?
                .verify(&content, &filter)
                .with_context(|| format!("downloaded {} {} is corrupt", resolved.name, version))?;
        }

        let expected = resolved
            .component_hash
            .as_deref()
            .or(info.component_hash.as_deref());
        let actual = hash_dir(&content, &filter)?;
        if let Some(expected) = expected {
            if actual != expected {
                return Err(IntegrityError::HashMismatch {
                    dir: content,
                    expected: expected.to_string(),
                    actual,
                })
                .with_context(|| format!("downloaded {} {} is corrupt", resolved.name, version));
            }
        }

        self.cache.store(&content, entry)?;
        tracing::info!("fetched {} {}", resolved.name, version);
        Ok(entry.to_path_buf())
    }

    fn listing(&self, full_name: &str) -> Result<Arc<client::ComponentResponse>> {
        let mut listings = self
            .listings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(listing) = listings.get(full_name) {
            return Ok(Arc::clone(listing));
        }

        let listing = Arc::new(
            self.client
                .component(full_name)
                .with_context(|| format!("failed to get versions of {}", full_name))?,
        );
        listings.insert(full_name.to_string(), Arc::clone(&listing));
        Ok(listing)
    }

    fn dependencies(
        &self,
        parent: &str,
        deps: &[client::DependencyResponse],
    ) -> Result<Vec<Requirement>, ManifestError> {
        let invalid = |name: &str, reason: String| ManifestError::InvalidDependency {
            name: format!("{} (required by {})", name, parent),
            reason,
        };

        let mut requirements = Vec::with_capacity(deps.len());
        for dep in deps {
            let spec = VersionSpec::parse(&dep.spec).map_err(|e| invalid(&dep.name, e.to_string()))?;

            let mut requirement = if dep.source.as_deref() == Some("idf")
                || name::normalize(&dep.name) == TOOLCHAIN_NAME
            {
                Requirement::toolchain(spec)
            } else {
                let namespace = dep.namespace.as_deref().unwrap_or(&self.namespace);
                let full_name = name::qualify(&dep.name, namespace);
                if !name::is_valid(&full_name) {
                    return Err(invalid(&dep.name, "invalid component name".to_string()));
                }
                let ns = name::split(&full_name).0.map(str::to_string);
                let url = dep.registry_url.as_deref().unwrap_or(&self.url);
                Requirement::new(full_name, SourceRef::registry(url, ns.as_deref()), spec)
            };

            requirement.rules = parse_rules(&dep.rules)?;
            requirement.matches = parse_rules(&dep.matches)?;
            requirement.pre_release = dep.pre_release.unwrap_or(false);
            requirement.public = dep.is_public;
            requirements.push(requirement);
        }
        requirements.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(requirements)
    }
}

fn parse_rules(specs: &[RuleSpec]) -> Result<Vec<Rule>, ManifestError> {
    specs.iter().map(|s| Rule::parse(&s.condition)).collect()
}

/// Version of this tool, for `min_component_manager_version` checks.
fn tool_version() -> semver::Version {
    semver::Version::parse(crate::VERSION).unwrap_or_else(|_| semver::Version::new(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ComponentBuilder, FakeRegistry};
    use tempfile::TempDir;

    fn source(registry: &FakeRegistry, cache: &Path) -> RegistrySource {
        let source_ref = SourceRef::registry(&registry.url(), Some("ex"));
        RegistrySource::new(source_ref, ComponentCache::new(cache), &EnvConfig::default()).unwrap()
    }

    #[test]
    fn test_versions_filter_target_and_tool_version() {
        let tmp = TempDir::new().unwrap();
        let registry = FakeRegistry::start();
        registry.publish(ComponentBuilder::new("ex/cmp", "1.0.0").targets(&["esp32"]));
        registry.publish(ComponentBuilder::new("ex/cmp", "1.1.0"));
        registry.publish(ComponentBuilder::new("ex/cmp", "9.0.0").min_tool_version("999.0.0"));
        registry.serve();

        let src = source(&registry, tmp.path());
        let all = src
            .versions("ex/cmp", &VersionSpec::any(), Some("esp32s3"))
            .unwrap();
        let versions: Vec<String> = all.versions.iter().map(|v| v.version().to_string()).collect();
        assert_eq!(versions, vec!["1.1.0"]);
        assert!(all.other_targets.iter().any(|d| d.ends_with("(esp32)")));
        assert!(all.diagnostics.iter().any(|d| d.contains("999.0.0")));
    }

    #[test]
    fn test_dependencies_are_qualified() {
        let tmp = TempDir::new().unwrap();
        let registry = FakeRegistry::start();
        registry.publish(
            ComponentBuilder::new("ex/cmp", "1.0.0")
                .dependency("dep", "^2.0")
                .dependency("idf", ">=5.0"),
        );
        registry.serve();

        let src = source(&registry, tmp.path());
        let all = src.versions("ex/cmp", &VersionSpec::any(), None).unwrap();
        let deps = all.versions[0].dependencies();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].name, "espressif/dep");
        assert!(deps[0].source.is_registry());
        assert_eq!(deps[1].source, SourceRef::Toolchain);
    }

    #[test]
    fn test_fetch_verifies_and_caches() {
        let tmp = TempDir::new().unwrap();
        let registry = FakeRegistry::start();
        let builder = ComponentBuilder::new("ex/cmp", "3.3.7").file("src/cmp.c", "int cmp;");
        let hash = registry.publish(builder);
        registry.serve();

        let src = source(&registry, &tmp.path().join("cache"));
        let resolved = ResolvedComponent::new(
            "ex/cmp",
            Version::parse("3.3.7").unwrap(),
            src.source_ref().clone(),
        )
        .with_hash(Some(hash.clone()));

        let dest = tmp.path().join("managed/ex__cmp");
        src.fetch(&resolved, &dest).unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("src/cmp.c")).unwrap(),
            "int cmp;"
        );

        let entry = src.component_cache_path("ex/cmp", &resolved.version, Some(&hash));
        assert!(src.cache.lookup(&entry, Some(&hash)).is_some());
        assert_eq!(registry.download_hits("ex/cmp", "3.3.7"), 1);

        // second fetch is served from the cache
        let again = tmp.path().join("managed2/ex__cmp");
        src.fetch(&resolved, &again).unwrap();
        assert_eq!(registry.download_hits("ex/cmp", "3.3.7"), 1);
    }

    #[test]
    fn test_fetch_rejects_wrong_hash() {
        let tmp = TempDir::new().unwrap();
        let registry = FakeRegistry::start();
        registry.publish(ComponentBuilder::new("ex/cmp", "1.0.0"));
        registry.serve();

        let src = source(&registry, &tmp.path().join("cache"));
        let resolved = ResolvedComponent::new(
            "ex/cmp",
            Version::parse("1.0.0").unwrap(),
            src.source_ref().clone(),
        )
        .with_hash(Some("0".repeat(64)));

        let err = src.fetch(&resolved, &tmp.path().join("out")).unwrap_err();
        assert_eq!(crate::util::errors::classify(&err), crate::util::errors::ErrorKind::Integrity);
    }
}
