//! Toolchain source - the framework itself as a component named `idf`.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::core::context::BuildContext;
use crate::core::source_id::SourceRef;
use crate::core::summary::{ComponentVersion, ComponentWithVersions};
use crate::core::version::{Version, VersionSpec};
use crate::resolver::ResolvedComponent;
use crate::util::config::EnvConfig;
use crate::util::errors::EnvironmentError;

#[derive(Debug)]
pub struct ToolchainSource {
    source_ref: SourceRef,
    version: Option<Version>,
    install_path: Option<PathBuf>,
}

impl ToolchainSource {
    pub fn new(ctx: &BuildContext, env: &EnvConfig) -> Self {
        ToolchainSource {
            source_ref: SourceRef::Toolchain,
            version: ctx.toolchain_version.clone(),
            install_path: env.idf_path(),
        }
    }

    pub fn source_ref(&self) -> &SourceRef {
        &self.source_ref
    }

    /// The toolchain version string.
    pub fn hash_key(&self) -> String {
        self.version
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default()
    }

    /// The running toolchain, if it matches.
    pub fn versions(
        &self,
        name: &str,
        spec: &VersionSpec,
        _target: Option<&str>,
    ) -> Result<ComponentWithVersions> {
        let version = self
            .version
            .clone()
            .ok_or(EnvironmentError::ToolchainVersionUnknown)?;

        let mut result = ComponentWithVersions::new(name, Vec::new());
        if spec.matches_with(&version, true) {
            result.versions.push(ComponentVersion::new(version, Vec::new()));
        } else {
            result
                .diagnostics
                .push(format!("the toolchain is version {}", version));
        }
        Ok(result)
    }

    /// The toolchain install directory. Nothing is copied.
    pub fn fetch(&self, _resolved: &ResolvedComponent, _dest: &Path) -> Result<PathBuf> {
        Ok(self
            .install_path
            .clone()
            .ok_or(EnvironmentError::ToolchainPathUnknown)?)
    }
}
