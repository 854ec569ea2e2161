//! Error taxonomy and exit codes.
//!
//! Leaf modules raise their own `thiserror` types; everything above them
//! propagates `anyhow::Error`. [`classify`] walks an error chain and maps the
//! first typed error it recognizes onto an [`ErrorKind`].

use std::fmt;

use thiserror::Error;

use crate::core::manifest::ManifestError;
use crate::core::version::VersionError;
use crate::ops::lockfile::LockError;
use crate::resolver::errors::ResolveError;
use crate::sources::git::GitError;
use crate::sources::registry::archive::ArchiveError;
use crate::sources::registry::client::RegistryError;
use crate::util::checksums::IntegrityError;
use crate::util::filter::FilterError;

/// Broad category of a failure, used for rendering and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed manifest or lock, bad argument, invalid URL or path.
    UserInput,
    /// The solver proved that no solution exists.
    Unsatisfiable,
    /// Namespace, component or version not found at the source.
    NotFound,
    /// Hash mismatch, malformed checksums, modified managed component.
    Integrity,
    /// Connection failure, timeout or HTTP status >= 400.
    Network,
    /// Missing env var, absent or outdated git, unsupported archive.
    Environment,
    /// Invariant violation.
    Internal,
}

impl ErrorKind {
    /// Process exit code for this kind of failure.
    ///
    /// Usage errors exit with 2, but those are produced by the argument
    /// parser before any of our code runs.
    pub fn exit_code(self) -> i32 {
        1
    }

    /// Short lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UserInput => "user input",
            ErrorKind::Unsatisfiable => "unsatisfiable",
            ErrorKind::NotFound => "not found",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Network => "network",
            ErrorKind::Environment => "environment",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures caused by the process environment rather than by input data.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("environment variable `{name}` used in `{value}` is not set")]
    UnresolvedVariable { name: String, value: String },

    #[error("toolchain version is unknown; set IDF_VERSION or pass it explicitly")]
    ToolchainVersionUnknown,

    #[error("toolchain path is unknown; set IDF_PATH")]
    ToolchainPathUnknown,

    #[error("operation cancelled")]
    Cancelled,
}

/// Map the first recognized error in the chain onto its kind.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<ResolveError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<IntegrityError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<RegistryError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<GitError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<ArchiveError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<LockError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<ManifestError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<VersionError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<FilterError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<EnvironmentError>() {
            return match e {
                EnvironmentError::Cancelled => ErrorKind::UserInput,
                _ => ErrorKind::Environment,
            };
        }
        if cause.downcast_ref::<reqwest::Error>().is_some() {
            return ErrorKind::Network;
        }
        if cause.downcast_ref::<serde_yaml::Error>().is_some()
            || cause.downcast_ref::<serde_json::Error>().is_some()
        {
            return ErrorKind::UserInput;
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return ErrorKind::Environment;
        }
    }
    ErrorKind::Internal
}
