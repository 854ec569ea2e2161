//! Environment-driven configuration.
//!
//! The process environment is captured once into an [`EnvConfig`] and then
//! threaded explicitly; nothing below the binary reads `std::env` directly.
//! Tests build configs from literal variable lists instead.
//!
//! Recognized variables:
//! - `IDF_COMPONENT_REGISTRY_URL`, `IDF_COMPONENT_STORAGE_URL`,
//!   `IDF_COMPONENT_API_TOKEN`
//! - `IDF_COMPONENT_CACHE_PATH`
//! - `IDF_COMPONENT_OVERWRITE_MANAGED_COMPONENTS`,
//!   `IDF_COMPONENT_STRICT_CHECKSUM`, `IDF_COMPONENT_CHECK_NEW_VERSION`
//! - `IDF_COMPONENT_NAMESPACE`, `IDF_PATH`, `IDF_TARGET`, `IDF_VERSION`

use std::collections::BTreeMap;
use std::path::PathBuf;

pub const ENV_REGISTRY_URL: &str = "IDF_COMPONENT_REGISTRY_URL";
pub const ENV_STORAGE_URL: &str = "IDF_COMPONENT_STORAGE_URL";
pub const ENV_API_TOKEN: &str = "IDF_COMPONENT_API_TOKEN";
pub const ENV_CACHE_PATH: &str = "IDF_COMPONENT_CACHE_PATH";
pub const ENV_OVERWRITE_MANAGED: &str = "IDF_COMPONENT_OVERWRITE_MANAGED_COMPONENTS";
pub const ENV_STRICT_CHECKSUM: &str = "IDF_COMPONENT_STRICT_CHECKSUM";
pub const ENV_CHECK_NEW_VERSION: &str = "IDF_COMPONENT_CHECK_NEW_VERSION";
pub const ENV_NAMESPACE: &str = "IDF_COMPONENT_NAMESPACE";
pub const ENV_IDF_PATH: &str = "IDF_PATH";
pub const ENV_IDF_TARGET: &str = "IDF_TARGET";
pub const ENV_IDF_VERSION: &str = "IDF_VERSION";

/// Namespace assumed for registry components named without one.
pub const DEFAULT_NAMESPACE: &str = "espressif";

/// Snapshot of the environment variables the manager consumes.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    vars: BTreeMap<String, String>,
}

impl EnvConfig {
    /// Capture the current process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build a config from explicit variables.
    pub fn from_vars<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        EnvConfig {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Set a variable, returning the updated config.
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Look up a variable. Empty values count as unset.
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }

    fn flag(&self, name: &str, default: bool) -> bool {
        match self.var(name) {
            Some(value) => parse_bool(value).unwrap_or_else(|| {
                tracing::warn!("ignoring unrecognized value `{}` for {}", value, name);
                default
            }),
            None => default,
        }
    }

    pub fn registry_url(&self) -> Option<&str> {
        self.var(ENV_REGISTRY_URL)
    }

    pub fn storage_url(&self) -> Option<&str> {
        self.var(ENV_STORAGE_URL)
    }

    pub fn api_token(&self) -> Option<&str> {
        self.var(ENV_API_TOKEN)
    }

    pub fn cache_path(&self) -> Option<PathBuf> {
        self.var(ENV_CACHE_PATH).map(PathBuf::from)
    }

    /// Re-fetch modified managed components instead of failing.
    pub fn overwrite_managed_components(&self) -> bool {
        self.flag(ENV_OVERWRITE_MANAGED, false)
    }

    /// Treat any integrity mismatch in managed components as fatal.
    pub fn strict_checksum(&self) -> bool {
        self.flag(ENV_STRICT_CHECKSUM, false)
    }

    pub fn check_new_version(&self) -> bool {
        self.flag(ENV_CHECK_NEW_VERSION, true)
    }

    /// Namespace for unqualified registry names.
    pub fn namespace(&self) -> &str {
        self.var(ENV_NAMESPACE).unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn idf_path(&self) -> Option<PathBuf> {
        self.var(ENV_IDF_PATH).map(PathBuf::from)
    }

    pub fn target(&self) -> Option<&str> {
        self.var(ENV_IDF_TARGET)
    }

    pub fn idf_version(&self) -> Option<&str> {
        self.var(ENV_IDF_VERSION)
    }
}

/// Parse `1/true/yes/on` and `0/false/no/off`, case-insensitively.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" => Some(true),
        "0" | "false" | "no" | "off" | "n" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let env = EnvConfig::default();
        assert!(!env.strict_checksum());
        assert!(!env.overwrite_managed_components());
        assert!(env.check_new_version());
        assert_eq!(env.namespace(), "espressif");
        assert!(env.registry_url().is_none());
    }

    #[test]
    fn test_flags() {
        let env = EnvConfig::from_vars([
            (ENV_STRICT_CHECKSUM, "Yes"),
            (ENV_CHECK_NEW_VERSION, "0"),
            (ENV_OVERWRITE_MANAGED, "maybe"),
        ]);
        assert!(env.strict_checksum());
        assert!(!env.check_new_version());
        assert!(!env.overwrite_managed_components());
    }

    #[test]
    fn test_empty_is_unset() {
        let env = EnvConfig::default()
            .with_var(ENV_NAMESPACE, "")
            .with_var(ENV_IDF_TARGET, "esp32s3");
        assert_eq!(env.namespace(), "espressif");
        assert_eq!(env.target(), Some("esp32s3"));
    }
}
