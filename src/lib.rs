//! ESP-IDF component manager.
//!
//! This crate provides the library behind `compote`: manifest parsing,
//! dependency resolution over registry, git, local and toolchain sources,
//! content-addressed integrity checks and the lock file.

pub mod core;
pub mod ops;
pub mod resolver;
pub mod sources;
pub mod util;

/// Fixtures and an in-process registry for unit tests.
#[cfg(test)]
pub mod test_support;

/// Version of this tool, recorded in lock files.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use core::{BuildContext, Manifest, Requirement, SourceRef, Version, VersionSpec};
pub use ops::{prepare, LockFile, PrepareOptions, PrepareResult};
pub use resolver::Resolve;
pub use util::context::GlobalContext;
