//! High-level operations.
//!
//! This module contains the implementation of `compote` commands.

pub mod cache;
pub mod lockfile;
pub mod prepare;
pub mod version_check;

pub use cache::{cache_path, clear_cache};
pub use lockfile::{LockFile, LockedComponent, LockedSource, LOCK_FILENAME};
pub use prepare::{prepare, CancelToken, PrepareOptions, PrepareResult, MANAGED_COMPONENTS_DIR};
