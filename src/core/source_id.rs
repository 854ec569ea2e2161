//! Source identification: where a component comes from.
//!
//! A [`SourceRef`] is a plain value. Two refs are the same source iff every
//! field matches after canonicalization, which the constructors perform.

use std::fmt;
use std::path::{Path, PathBuf};

use url::Url;

use crate::util::fs::normalize_path;

/// Public component registry.
pub const DEFAULT_REGISTRY_URL: &str = "https://components.espressif.com/";

/// API endpoint of the public registry; normalized to [`DEFAULT_REGISTRY_URL`].
const DEFAULT_API_HOST: &str = "api.components.espressif.com";

/// Identity of a component source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceRef {
    /// Component registry. The namespace is the one the component name is
    /// qualified with.
    Registry {
        url: String,
        namespace: Option<String>,
    },
    /// Directory on the local filesystem, canonicalized.
    Local { path: PathBuf },
    /// Git repository, optionally a sub-directory at a given ref.
    Git {
        repo: String,
        path: Option<String>,
        reference: Option<String>,
    },
    /// The toolchain itself, a single well-known identity.
    Toolchain,
}

/// How strongly a source claims a component name. Higher wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourcePriority {
    Toolchain = 0,
    Registry = 1,
    Git = 2,
    Local = 3,
}

impl SourceRef {
    pub fn registry(url: &str, namespace: Option<&str>) -> Self {
        SourceRef::Registry {
            url: normalize_registry_url(url),
            namespace: namespace.map(|ns| ns.to_lowercase()),
        }
    }

    /// The public registry.
    pub fn default_registry(namespace: Option<&str>) -> Self {
        Self::registry(DEFAULT_REGISTRY_URL, namespace)
    }

    pub fn local(path: &Path) -> Self {
        SourceRef::Local {
            path: normalize_path(path),
        }
    }

    pub fn git(repo: &str, path: Option<&str>, reference: Option<&str>) -> Self {
        let path = path
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        SourceRef::Git {
            repo: repo.trim().to_string(),
            path,
            reference: reference.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()),
        }
    }

    pub fn priority(&self) -> SourcePriority {
        match self {
            SourceRef::Local { .. } => SourcePriority::Local,
            SourceRef::Git { .. } => SourcePriority::Git,
            SourceRef::Registry { .. } => SourcePriority::Registry,
            SourceRef::Toolchain => SourcePriority::Toolchain,
        }
    }

    /// Registry and git sources must be downloaded; the others are used in
    /// place.
    pub fn download_required(&self) -> bool {
        matches!(self, SourceRef::Registry { .. } | SourceRef::Git { .. })
    }

    /// The `type` tag written to the lock file.
    pub fn type_name(&self) -> &'static str {
        match self {
            SourceRef::Registry { .. } => "service",
            SourceRef::Local { .. } => "local",
            SourceRef::Git { .. } => "git",
            SourceRef::Toolchain => "idf",
        }
    }

    pub fn is_registry(&self) -> bool {
        matches!(self, SourceRef::Registry { .. })
    }

    pub fn is_local(&self) -> bool {
        matches!(self, SourceRef::Local { .. })
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Registry { url, .. } => write!(f, "registry `{}`", url),
            SourceRef::Local { path } => write!(f, "path `{}`", path.display()),
            SourceRef::Git {
                repo,
                path,
                reference,
            } => {
                write!(f, "git `{}`", repo)?;
                if let Some(reference) = reference {
                    write!(f, " at `{}`", reference)?;
                }
                if let Some(path) = path {
                    write!(f, " (path `{}`)", path)?;
                }
                Ok(())
            }
            SourceRef::Toolchain => f.write_str("toolchain"),
        }
    }
}

/// Canonical public form of a registry URL.
///
/// Drops a trailing `/api`, maps the API host of the public registry to its
/// public host and always ends with `/`.
pub fn normalize_registry_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/api").unwrap_or(trimmed);

    let mut normalized = match Url::parse(trimmed) {
        Ok(mut parsed) => {
            if parsed.host_str() == Some(DEFAULT_API_HOST) {
                return DEFAULT_REGISTRY_URL.to_string();
            }
            let path = parsed.path().trim_end_matches('/').to_string();
            parsed.set_path(&path);
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => trimmed.to_string(),
    };

    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    normalized
}
