//! Local source - components in a directory on disk.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::core::manifest::{Manifest, MANIFEST_FILENAME};
use crate::core::source_id::SourceRef;
use crate::core::summary::{ComponentVersion, ComponentWithVersions};
use crate::core::version::{Version, VersionSpec};
use crate::resolver::ResolvedComponent;
use crate::util::config::EnvConfig;

/// A source for path dependencies, overrides and project components.
///
/// The directory is used in place; nothing is copied or hashed.
#[derive(Debug)]
pub struct LocalSource {
    source_ref: SourceRef,
    path: PathBuf,
    env: EnvConfig,
}

impl LocalSource {
    pub fn new(source_ref: SourceRef, env: &EnvConfig) -> Result<Self> {
        let SourceRef::Local { path } = &source_ref else {
            bail!("not a local source: {}", source_ref);
        };
        Ok(LocalSource {
            path: path.clone(),
            source_ref,
            env: env.clone(),
        })
    }

    pub fn source_ref(&self) -> &SourceRef {
        &self.source_ref
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The canonical directory path.
    pub fn hash_key(&self) -> String {
        self.path.display().to_string()
    }

    /// The manifest of the directory, if it has one.
    pub fn manifest(&self) -> Result<Option<Manifest>> {
        if !self.path.is_dir() {
            bail!("local component directory {} does not exist", self.path.display());
        }
        if self.path.join(MANIFEST_FILENAME).is_file() {
            Ok(Some(Manifest::load_dir(&self.path, &self.env)?))
        } else {
            Ok(None)
        }
    }

    /// A single version synthesized from the directory's manifest.
    ///
    /// The version spec does not filter; a local directory is what it is.
    pub fn versions(
        &self,
        name: &str,
        _spec: &VersionSpec,
        target: Option<&str>,
    ) -> Result<ComponentWithVersions> {
        let manifest = self.manifest()?;
        let (version, dependencies, targets) = match manifest {
            Some(m) => (m.version.unwrap_or(Version::Any), m.dependencies, m.targets),
            None => (Version::Any, Vec::new(), Vec::new()),
        };

        let candidate = ComponentVersion::new(version, dependencies).with_targets(targets);
        let mut result = ComponentWithVersions::new(name, Vec::new());
        match target {
            Some(target) if !candidate.supports_target(target) => {
                result.reject_target(candidate.version(), candidate.targets());
            }
            _ => result.versions.push(candidate),
        }
        Ok(result)
    }

    /// Local components are not copied; the directory itself is returned.
    pub fn fetch(&self, _resolved: &ResolvedComponent, _dest: &Path) -> Result<PathBuf> {
        if !self.path.is_dir() {
            bail!("local component directory {} does not exist", self.path.display());
        }
        Ok(self.path.clone())
    }
}
