//! Summaries: what a source reports about a component's versions.
//!
//! A [`ComponentVersion`] carries just enough for resolution and fetching:
//! the version, its content hash, dependencies, supported targets and where
//! to download it from.

use std::sync::Arc;

use crate::core::dependency::Requirement;
use crate::core::version::Version;

/// One candidate version of a component.
///
/// Cloning is cheap; the payload is shared.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentVersion {
    inner: Arc<ComponentVersionInner>,
}

#[derive(Debug, Clone, PartialEq)]
struct ComponentVersionInner {
    version: Version,
    component_hash: Option<String>,
    dependencies: Vec<Requirement>,
    targets: Vec<String>,
    download_url: Option<String>,
    checksums_url: Option<String>,
}

impl ComponentVersion {
    pub fn new(version: Version, dependencies: Vec<Requirement>) -> Self {
        ComponentVersion {
            inner: Arc::new(ComponentVersionInner {
                version,
                component_hash: None,
                dependencies,
                targets: Vec::new(),
                download_url: None,
                checksums_url: None,
            }),
        }
    }

    pub fn with_hash(mut self, hash: Option<String>) -> Self {
        Arc::make_mut(&mut self.inner).component_hash = hash;
        self
    }

    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        Arc::make_mut(&mut self.inner).targets =
            targets.into_iter().map(|t| t.to_lowercase()).collect();
        self
    }

    pub fn with_download(mut self, download_url: String, checksums_url: Option<String>) -> Self {
        let inner = Arc::make_mut(&mut self.inner);
        inner.download_url = Some(download_url);
        inner.checksums_url = checksums_url;
        self
    }

    pub fn version(&self) -> &Version {
        &self.inner.version
    }

    pub fn component_hash(&self) -> Option<&str> {
        self.inner.component_hash.as_deref()
    }

    pub fn dependencies(&self) -> &[Requirement] {
        &self.inner.dependencies
    }

    /// Supported targets; empty means every target.
    pub fn targets(&self) -> &[String] {
        &self.inner.targets
    }

    pub fn download_url(&self) -> Option<&str> {
        self.inner.download_url.as_deref()
    }

    pub fn checksums_url(&self) -> Option<&str> {
        self.inner.checksums_url.as_deref()
    }

    pub fn supports_target(&self, target: &str) -> bool {
        self.inner.targets.is_empty() || self.inner.targets.iter().any(|t| t == target)
    }
}

/// All versions of a component a source offers, plus notes on versions it
/// left out.
#[derive(Debug, Clone, Default)]
pub struct ComponentWithVersions {
    pub name: String,
    pub versions: Vec<ComponentVersion>,
    pub diagnostics: Vec<String>,
    /// Versions left out because they support only other targets,
    /// rendered as `1.0.0 (esp32, esp32s2)`
    pub other_targets: Vec<String>,
}

impl ComponentWithVersions {
    pub fn new(name: impl Into<String>, versions: Vec<ComponentVersion>) -> Self {
        ComponentWithVersions {
            name: name.into(),
            versions,
            diagnostics: Vec::new(),
            other_targets: Vec::new(),
        }
    }

    /// Record a version dropped for not supporting the build target.
    pub fn reject_target(&mut self, version: &Version, targets: &[String]) {
        self.other_targets
            .push(format!("{} ({})", version, targets.join(", ")));
    }

    pub fn find(&self, version: &Version) -> Option<&ComponentVersion> {
        self.versions.iter().find(|v| v.version() == version)
    }
}
