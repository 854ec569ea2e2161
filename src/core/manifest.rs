//! Manifest parsing (`idf_component.yml`).
//!
//! Loading a manifest is three steps: parse the YAML into a generic tree,
//! substitute `$VAR` / `${VAR}` references in every string from the
//! environment, then deserialize the known fields. Unknown top-level keys
//! are accepted (they belong to tools outside the solver), while dependency
//! entries are strict.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

use crate::core::dependency::{DependencySpec, Requirement};
use crate::core::version::Version;
use crate::util::config::EnvConfig;
use crate::util::errors::ErrorKind;
use crate::util::filter::FileFilter;
use crate::util::hash::hash_object;

/// Manifest file name inside a project or component directory.
pub const MANIFEST_FILENAME: &str = "idf_component.yml";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid dependency `{name}`: {reason}")]
    InvalidDependency { name: String, reason: String },

    #[error("invalid rule `{rule}`: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("override_path of `{name}` points to {}, which has no idf_component.yml", .path.display())]
    MissingOverrideManifest { name: String, path: PathBuf },

    #[error("environment variable `{name}` used in `{value}` is not set")]
    UnresolvedVariable { name: String, value: String },

    #[error("target `{target}` is not supported; supported targets: {}", .supported.join(", "))]
    TargetNotSupported {
        target: String,
        supported: Vec<String>,
    },
}

impl ManifestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManifestError::UnresolvedVariable { .. } => ErrorKind::Environment,
            _ => ErrorKind::UserInput,
        }
    }
}

/// `files:` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub use_gitignore: bool,
}

impl FilesSpec {
    pub fn into_filter(self) -> FileFilter {
        FileFilter {
            include: self.include,
            exclude: self.exclude,
            use_gitignore: self.use_gitignore,
            ..FileFilter::default()
        }
    }
}

/// The file filter of the component in `dir`: its manifest's `files`
/// section on top of the default excludes.
///
/// Only `files` is read, without environment substitution, so a manifest
/// whose other fields reference unset variables still yields its filter.
pub fn component_filter(dir: &Path) -> Result<FileFilter> {
    let path = dir.join(MANIFEST_FILENAME);
    if !path.is_file() {
        return Ok(FileFilter::default());
    }
    let content = std::fs::read_to_string(&path).map_err(|source| ManifestError::Read {
        path: path.clone(),
        source,
    })?;
    let parse_err = |message: String| ManifestError::Parse {
        path: path.clone(),
        message,
    };

    let tree: Value = serde_yaml::from_str(&content).map_err(|e| parse_err(e.to_string()))?;
    let files = match tree.get("files") {
        Some(files) if !files.is_null() => serde_yaml::from_value::<FilesSpec>(files.clone())
            .map_err(|e| parse_err(e.to_string()))?,
        _ => FilesSpec::default(),
    };
    Ok(files.into_filter())
}

/// The user-facing fields of a manifest, after substitution.
///
/// This is also the value `manifest_hash` is computed over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<FilesSpec>,
}

/// A loaded manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub name: Option<String>,
    pub version: Option<Version>,
    /// Supported targets; empty means all
    pub targets: Vec<String>,
    /// Dependencies in name order
    pub dependencies: Vec<Requirement>,
    pub filter: FileFilter,
    pub manifest_hash: String,
    /// Directory the manifest was loaded from
    pub dir: PathBuf,
}

impl Manifest {
    /// Load `idf_component.yml` from a component or project directory.
    pub fn load_dir(dir: &Path, env: &EnvConfig) -> Result<Self> {
        Self::load(&dir.join(MANIFEST_FILENAME), env)
    }

    /// Load a manifest from a file path.
    pub fn load(path: &Path, env: &EnvConfig) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&content, path, dir, env)
    }

    /// Parse manifest content. `dir` anchors relative dependency paths.
    pub fn parse(content: &str, path: &Path, dir: &Path, env: &EnvConfig) -> Result<Self> {
        let parse_err = |message: String| ManifestError::Parse {
            path: path.to_path_buf(),
            message,
        };

        let mut tree: Value = serde_yaml::from_str(content).map_err(|e| parse_err(e.to_string()))?;
        if tree.is_null() {
            tree = Value::Mapping(Default::default());
        }
        substitute_env(&mut tree, env)?;

        let raw: RawManifest =
            serde_yaml::from_value(tree).map_err(|e| parse_err(e.to_string()))?;
        Self::from_raw(raw, path, dir, env)
    }

    fn from_raw(raw: RawManifest, path: &Path, dir: &Path, env: &EnvConfig) -> Result<Self> {
        let version = match &raw.version {
            Some(v) => Some(Version::parse(v).map_err(|e| ManifestError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?),
            None => None,
        };

        let mut dependencies = Vec::with_capacity(raw.dependencies.len());
        for (name, spec) in &raw.dependencies {
            dependencies.push(spec.to_requirement(name, dir, env)?);
        }
        dependencies.sort_by(|a, b| a.name.cmp(&b.name));

        let filter = raw.files.clone().unwrap_or_default().into_filter();

        Ok(Manifest {
            name: raw.name.clone(),
            version,
            targets: raw.targets.iter().map(|t| t.to_lowercase()).collect(),
            dependencies,
            filter,
            manifest_hash: hash_object(&raw)?,
            dir: dir.to_path_buf(),
        })
    }

    /// Fail if the manifest restricts targets and `target` is not one of them.
    pub fn check_target(&self, target: &str) -> Result<(), ManifestError> {
        if self.supports_target(target) {
            Ok(())
        } else {
            Err(ManifestError::TargetNotSupported {
                target: target.to_string(),
                supported: self.targets.clone(),
            })
        }
    }

    pub fn supports_target(&self, target: &str) -> bool {
        self.targets.is_empty() || self.targets.iter().any(|t| t == target)
    }
}

/// Replace `$VAR` and `${VAR}` in every string of the tree. `$$` is a
/// literal dollar and `$CONFIG{..}` is left for rule evaluation.
pub fn substitute_env(value: &mut Value, env: &EnvConfig) -> Result<(), ManifestError> {
    let pattern = Regex::new(r"\$(\$|\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .map_err(|e| ManifestError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;
    substitute_value(value, env, &pattern)
}

fn substitute_value(value: &mut Value, env: &EnvConfig, pattern: &Regex) -> Result<(), ManifestError> {
    match value {
        Value::String(s) => {
            if s.contains('$') {
                *s = substitute_str(s, env, pattern)?;
            }
        }
        Value::Sequence(items) => {
            for item in items {
                substitute_value(item, env, pattern)?;
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                substitute_value(item, env, pattern)?;
            }
        }
        Value::Tagged(tagged) => substitute_value(&mut tagged.value, env, pattern)?,
        _ => {}
    }
    Ok(())
}

fn substitute_str(input: &str, env: &EnvConfig, pattern: &Regex) -> Result<String, ManifestError> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;

    for caps in pattern.captures_iter(input) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&input[last..whole.start()]);
        last = whole.end();
        out.push_str(&expand(&caps, input, whole.end(), env)?);
    }
    out.push_str(&input[last..]);
    Ok(out)
}

fn expand(caps: &Captures<'_>, input: &str, end: usize, env: &EnvConfig) -> Result<String, ManifestError> {
    if caps.get(1).map(|m| m.as_str()) == Some("$") {
        return Ok("$".to_string());
    }
    let name = caps
        .get(2)
        .or_else(|| caps.get(3))
        .map(|m| m.as_str())
        .unwrap_or_default();

    // `$CONFIG{NAME}` belongs to rule expressions
    if caps.get(3).is_some() && name == "CONFIG" && input[end..].starts_with('{') {
        return Ok(format!("${}", name));
    }

    env.var(name)
        .map(str::to_string)
        .ok_or_else(|| ManifestError::UnresolvedVariable {
            name: name.to_string(),
            value: input.to_string(),
        })
}
