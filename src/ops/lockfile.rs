//! Lock file encoding, decoding and I/O.
//!
//! `dependencies.lock` is YAML with a strict schema: unknown keys are
//! errors, maps are written in key order and the graph must be closed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::source_id::SourceRef;
use crate::core::version::Version;
use crate::resolver::{Resolve, ResolvedComponent, ResolvedDependency};
use crate::util::errors::ErrorKind;
use crate::util::filter::to_posix;
use crate::util::fs::atomic_write;

pub const LOCK_FILENAME: &str = "dependencies.lock";

/// Written at the top of newly created lock files only.
const HEADER: &str = "# Generated by compote. Commit this file to reproduce the build.\n";

/// Keys that only appear in the legacy lock format.
const LEGACY_KEYS: &[&str] = &["components", "idf_version"];

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to read lock file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid lock file {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error(
        "lock file {} uses the legacy format (found `{key}`); delete it to create a new one",
        .path.display()
    )]
    Legacy { path: PathBuf, key: String },

    #[error("invalid component name `{name}` in lock file")]
    InvalidName { name: String },

    #[error("invalid version `{value}` for `{name}` in lock file")]
    InvalidVersion { name: String, value: String },

    #[error("lock file is incomplete: `{from}` depends on `{missing}`, which is not locked")]
    NotClosed { from: String, missing: String },
}

impl LockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LockError::Read { .. } => ErrorKind::Environment,
            _ => ErrorKind::UserInput,
        }
    }
}

/// The lock file document.
///
/// Fields are declared in key order, which is the order they are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockFile {
    pub component_manager_version: String,
    pub dependencies: BTreeMap<String, LockedComponent>,
    pub direct_dependencies: Vec<String>,
    pub manifest_hash: String,
    pub target: String,
}

/// One locked component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockedComponent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<LockedDependency>,
    pub source: LockedSource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockedDependency {
    pub name: String,
    pub version: String,
}

/// Where a locked component comes from, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum LockedSource {
    #[serde(rename = "service")]
    Service {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
        registry_url: String,
    },
    #[serde(rename = "git")]
    Git {
        git: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },
    /// `path` is relative to the project directory when the component lives
    /// inside it
    #[serde(rename = "local")]
    Local { path: String },
    /// Struct form, so extra keys are rejected like in the other variants
    #[serde(rename = "idf")]
    Idf {},
}

impl LockedSource {
    pub fn from_ref(source: &SourceRef, base: &Path) -> Self {
        match source {
            SourceRef::Registry { url, namespace } => LockedSource::Service {
                namespace: namespace.clone(),
                registry_url: url.clone(),
            },
            SourceRef::Git {
                repo,
                path,
                reference,
            } => LockedSource::Git {
                git: repo.clone(),
                path: path.clone(),
                reference: reference.clone(),
            },
            SourceRef::Local { path } => {
                let shown = match path.strip_prefix(base) {
                    Ok(rel) if !rel.as_os_str().is_empty() => to_posix(rel),
                    _ => path.display().to_string(),
                };
                LockedSource::Local { path: shown }
            }
            SourceRef::Toolchain => LockedSource::Idf {},
        }
    }

    pub fn to_ref(&self, base: &Path) -> SourceRef {
        match self {
            LockedSource::Service {
                namespace,
                registry_url,
            } => SourceRef::registry(registry_url, namespace.as_deref()),
            LockedSource::Git {
                git,
                path,
                reference,
            } => SourceRef::git(git, path.as_deref(), reference.as_deref()),
            LockedSource::Local { path } => SourceRef::local(&base.join(path)),
            LockedSource::Idf {} => SourceRef::Toolchain,
        }
    }
}

impl LockFile {
    /// Encode a resolve. Local paths are written relative to `project_dir`
    /// where possible.
    pub fn from_resolve(
        resolve: &Resolve,
        manifest_hash: &str,
        target: &str,
        project_dir: &Path,
    ) -> Self {
        let dependencies = resolve
            .components()
            .map(|c| {
                let locked = LockedComponent {
                    component_hash: c.component_hash.clone(),
                    dependencies: c
                        .dependencies
                        .iter()
                        .map(|d| LockedDependency {
                            name: d.name.clone(),
                            version: d.version.to_string(),
                        })
                        .collect(),
                    source: LockedSource::from_ref(&c.source, project_dir),
                    targets: c.targets.clone(),
                    version: c.version.to_string(),
                };
                (c.name.clone(), locked)
            })
            .collect();

        LockFile {
            component_manager_version: crate::VERSION.to_string(),
            dependencies,
            direct_dependencies: resolve.direct_dependencies().to_vec(),
            manifest_hash: manifest_hash.to_string(),
            target: target.to_string(),
        }
    }

    /// Decode into a resolve, checking that the graph is closed.
    pub fn to_resolve(&self, project_dir: &Path) -> Result<Resolve, LockError> {
        let parse = |name: &str, value: &str| {
            Version::parse(value).map_err(|_| LockError::InvalidVersion {
                name: name.to_string(),
                value: value.to_string(),
            })
        };

        let mut components = Vec::with_capacity(self.dependencies.len());
        for (name, locked) in &self.dependencies {
            if !crate::core::name::is_valid(name) {
                return Err(LockError::InvalidName { name: name.clone() });
            }
            let mut dependencies = Vec::with_capacity(locked.dependencies.len());
            for dep in &locked.dependencies {
                dependencies.push(ResolvedDependency {
                    name: dep.name.clone(),
                    version: parse(&dep.name, &dep.version)?,
                });
            }
            components.push(
                ResolvedComponent::new(
                    name.clone(),
                    parse(name, &locked.version)?,
                    locked.source.to_ref(project_dir),
                )
                .with_hash(locked.component_hash.clone())
                .with_dependencies(dependencies)
                .with_targets(locked.targets.clone()),
            );
        }

        let resolve = Resolve::from_components(self.direct_dependencies.iter().cloned(), components);
        if let Some((from, missing)) = resolve.missing_dependencies().into_iter().next() {
            return Err(LockError::NotClosed { from, missing });
        }
        Ok(resolve)
    }

    /// Whether the lock was produced for this manifest and target.
    pub fn is_fresh(&self, manifest_hash: &str, target: &str) -> bool {
        self.manifest_hash == manifest_hash && self.target == target
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, LockError> {
        let parse_err = |message: String| LockError::Parse {
            path: path.to_path_buf(),
            message,
        };

        let tree: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(|e| parse_err(e.to_string()))?;
        if let Some(key) = legacy_key(&tree) {
            return Err(LockError::Legacy {
                path: path.to_path_buf(),
                key,
            });
        }
        serde_yaml::from_value(tree).map_err(|e| parse_err(e.to_string()))
    }

    /// Load a lock file; `None` if it does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|source| LockError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(Self::parse(&content, path)?))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to serialize lock file")
    }

    /// Write atomically. The header comment is only added to new files.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut content = String::new();
        if !path.exists() {
            content.push_str(HEADER);
        }
        content.push_str(&self.to_yaml()?);
        atomic_write(path, content.as_bytes())?;
        tracing::debug!("wrote {}", path.display());
        Ok(())
    }
}

/// The first key that marks the legacy format, if any.
fn legacy_key(tree: &serde_yaml::Value) -> Option<String> {
    let map = tree.as_mapping()?;
    for key in LEGACY_KEYS {
        if map.contains_key(*key) {
            return Some(key.to_string());
        }
    }
    let components = map.get("dependencies")?.as_mapping()?;
    components
        .values()
        .filter_map(|c| c.as_mapping())
        .any(|c| c.contains_key("hash"))
        .then(|| "hash".to_string())
}
