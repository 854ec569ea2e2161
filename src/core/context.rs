//! Build context the solver evaluates rules against.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};

use crate::core::version::Version;
use crate::util::config::EnvConfig;

/// Target assumed when neither the caller nor `IDF_TARGET` names one.
pub const DEFAULT_TARGET: &str = "esp32";

/// Value of a resolved Kconfig option.
#[derive(Debug, Clone, PartialEq)]
pub enum KconfigValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for KconfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KconfigValue::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            KconfigValue::Int(i) => write!(f, "{}", i),
            KconfigValue::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Target, toolchain version and Kconfig options of one build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildContext {
    pub target: String,
    pub toolchain_version: Option<Version>,
    pub kconfig: BTreeMap<String, KconfigValue>,
}

impl BuildContext {
    pub fn new(target: impl Into<String>, toolchain_version: Option<Version>) -> Self {
        BuildContext {
            target: target.into().to_lowercase(),
            toolchain_version,
            kconfig: BTreeMap::new(),
        }
    }

    /// Build from `IDF_TARGET` and `IDF_VERSION`, with explicit overrides
    /// taking precedence.
    pub fn from_env(
        env: &EnvConfig,
        target: Option<&str>,
        toolchain_version: Option<&str>,
    ) -> Result<Self> {
        let target = target.or(env.target()).unwrap_or(DEFAULT_TARGET);
        let version = match toolchain_version.or(env.idf_version()) {
            Some(raw) => Some(
                Version::parse_lenient(raw)
                    .with_context(|| format!("invalid toolchain version `{}`", raw))?,
            ),
            None => None,
        };
        Ok(BuildContext::new(target, version))
    }

    pub fn with_kconfig(mut self, kconfig: BTreeMap<String, KconfigValue>) -> Self {
        self.kconfig = kconfig;
        self
    }

    /// Load Kconfig options from an `sdkconfig.json` style object.
    pub fn load_kconfig_json(mut self, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        for (name, value) in raw {
            let value = match value {
                serde_json::Value::Bool(b) => KconfigValue::Bool(b),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => KconfigValue::Int(i),
                    None => KconfigValue::Str(n.to_string()),
                },
                serde_json::Value::String(s) => KconfigValue::Str(s),
                _ => continue,
            };
            self.kconfig.insert(name, value);
        }
        Ok(self)
    }
}
