//! Test fixtures for common test scenarios.
//!
//! [`ProjectFixture`] lays out a project on disk; [`ComponentBuilder`]
//! describes a component version that can be written to a directory or
//! packed into a registry archive.

use std::path::{Path, PathBuf};

use crate::core::manifest::{component_filter, MANIFEST_FILENAME};
use crate::util::hash::hash_dir;

/// Fixture for a project directory.
#[derive(Debug, Clone, Default)]
pub struct ProjectFixture {
    /// idf_component.yml content
    pub manifest: String,
    /// Files relative to the project root
    pub files: Vec<(PathBuf, String)>,
    /// Components under `components/<dir>`
    pub components: Vec<(String, ComponentBuilder)>,
}

impl ProjectFixture {
    pub fn new(manifest: impl Into<String>) -> Self {
        ProjectFixture {
            manifest: manifest.into(),
            ..Default::default()
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.files.push((path.into(), content.into()));
        self
    }

    /// Add a project-local component under `components/<dir>`.
    pub fn with_component(mut self, dir: impl Into<String>, component: ComponentBuilder) -> Self {
        self.components.push((dir.into(), component));
        self
    }

    /// Write the project. The manifest lives in `main/`, as in a real
    /// project; the returned path is the project root.
    pub fn write_to(&self, root: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(root.join("main"))?;
        std::fs::write(root.join("main").join(MANIFEST_FILENAME), &self.manifest)?;
        for (path, content) in &self.files {
            let full = root.join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(full, content)?;
        }
        for (dir, component) in &self.components {
            component.write_to(&root.join("components").join(dir))?;
        }
        Ok(root.to_path_buf())
    }
}

/// One version of a component.
#[derive(Debug, Clone)]
pub struct ComponentBuilder {
    pub name: String,
    pub version: String,
    pub targets: Vec<String>,
    /// (name, spec)
    pub dependencies: Vec<(String, String)>,
    pub files: Vec<(String, String)>,
    /// `files.exclude` globs of the manifest
    pub excludes: Vec<String>,
    pub min_tool_version: Option<String>,
}

impl ComponentBuilder {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        ComponentBuilder {
            name: name.into(),
            version: version.into(),
            targets: Vec::new(),
            dependencies: Vec::new(),
            files: vec![("CMakeLists.txt".into(), "idf_component_register()\n".into())],
            excludes: Vec::new(),
            min_tool_version: None,
        }
    }

    pub fn targets(mut self, targets: &[&str]) -> Self {
        self.targets = targets.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn dependency(mut self, name: &str, spec: &str) -> Self {
        self.dependencies.push((name.into(), spec.into()));
        self
    }

    pub fn file(mut self, path: &str, content: &str) -> Self {
        self.files.push((path.into(), content.into()));
        self
    }

    pub fn exclude(mut self, pattern: &str) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    pub fn min_tool_version(mut self, version: &str) -> Self {
        self.min_tool_version = Some(version.into());
        self
    }

    /// The component's own `idf_component.yml`.
    pub fn manifest(&self) -> String {
        let mut out = format!("version: \"{}\"\n", self.version);
        if !self.targets.is_empty() {
            out.push_str("targets:\n");
            for target in &self.targets {
                out.push_str(&format!("  - {}\n", target));
            }
        }
        if !self.dependencies.is_empty() {
            out.push_str("dependencies:\n");
            for (name, spec) in &self.dependencies {
                out.push_str(&format!("  {}: \"{}\"\n", name, spec));
            }
        }
        if !self.excludes.is_empty() {
            out.push_str("files:\n  exclude:\n");
            for pattern in &self.excludes {
                out.push_str(&format!("    - \"{}\"\n", pattern));
            }
        }
        out
    }

    /// Write the component, manifest included, into `dir`.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(MANIFEST_FILENAME), self.manifest())?;
        for (path, content) in &self.files {
            let full = dir.join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(full, content)?;
        }
        Ok(())
    }

    /// Pack the component as a `.tgz`. Returns the archive bytes and the
    /// component hash of its content.
    pub fn pack(&self) -> (Vec<u8>, String) {
        let tmp = tempfile::tempdir().unwrap();
        self.write_to(tmp.path()).unwrap();
        let hash = hash_dir(tmp.path(), &component_filter(tmp.path()).unwrap()).unwrap();
        (tarball(tmp.path()), hash)
    }
}

/// gzip-compressed tarball of every file under `dir`.
pub fn tarball(dir: &Path) -> Vec<u8> {
    let enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(enc);
    builder.append_dir_all(".", dir).unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

/// Commonly used manifests.
pub mod manifests {
    /// A project manifest depending on the given `(name, spec)` pairs.
    pub fn with_dependencies(deps: &[(&str, &str)]) -> String {
        let mut out = String::from("dependencies:\n");
        for (name, spec) in deps {
            out.push_str(&format!("  {}: \"{}\"\n", name, spec));
        }
        out
    }
}
