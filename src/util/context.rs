//! Global context for manager operations.
//!
//! Resolves the cache root once and carries the working directory and the
//! environment snapshot to every operation.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use directories::BaseDirs;

use crate::util::config::EnvConfig;

static BASE_DIRS: LazyLock<Option<BaseDirs>> = LazyLock::new(BaseDirs::new);

/// Global context containing configuration and paths.
#[derive(Debug, Clone)]
pub struct GlobalContext {
    /// Current working directory
    cwd: PathBuf,

    /// Root of the shared component cache
    cache_root: PathBuf,

    env: EnvConfig,

    verbose: bool,
}

impl GlobalContext {
    /// Create a context from the process environment.
    pub fn new() -> Result<Self> {
        let cwd = std::env::current_dir().context("failed to get current directory")?;
        Ok(Self::with_env(cwd, EnvConfig::from_env()))
    }

    /// Create a context with an explicit working directory and environment.
    pub fn with_env(cwd: PathBuf, env: EnvConfig) -> Self {
        let cache_root = default_cache_root(&env);
        GlobalContext {
            cwd,
            cache_root,
            env,
            verbose: false,
        }
    }

    /// Set verbose mode.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Get the current working directory.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Root of the component cache.
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn env(&self) -> &EnvConfig {
        &self.env
    }

    /// Check if verbose mode is enabled.
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// `IDF_COMPONENT_CACHE_PATH`, else the platform cache directory.
fn default_cache_root(env: &EnvConfig) -> PathBuf {
    if let Some(path) = env.cache_path() {
        return path;
    }
    match BASE_DIRS.as_ref() {
        Some(dirs) => dirs.cache_dir().join("Espressif").join("ComponentManager"),
        None => std::env::temp_dir().join("idf-component-manager-cache"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::config::ENV_CACHE_PATH;
    use tempfile::TempDir;

    #[test]
    fn test_cache_root_from_env() {
        let tmp = TempDir::new().unwrap();
        let env = EnvConfig::default().with_var(ENV_CACHE_PATH, tmp.path().to_string_lossy());
        let ctx = GlobalContext::with_env(tmp.path().to_path_buf(), env);
        assert_eq!(ctx.cache_root(), tmp.path());
    }

    #[test]
    fn test_platform_cache_root() {
        let ctx = GlobalContext::with_env(PathBuf::from("/work"), EnvConfig::default());
        assert!(ctx.cache_root().ends_with("Espressif/ComponentManager")
            || ctx.cache_root().ends_with("idf-component-manager-cache"));
        assert_eq!(ctx.cwd(), Path::new("/work"));
    }
}
