//! Core data structures.
//!
//! This module contains the foundational types used throughout the crate:
//! - Versions, version specs and component names
//! - Source references and requirements
//! - Manifests, rules and the build context

pub mod context;
pub mod dependency;
pub mod manifest;
pub mod name;
pub mod rules;
pub mod source_id;
pub mod summary;
pub mod version;

pub use context::BuildContext;
pub use dependency::Requirement;
pub use manifest::Manifest;
pub use source_id::SourceRef;
pub use summary::{ComponentVersion, ComponentWithVersions};
pub use version::{Version, VersionSpec};
