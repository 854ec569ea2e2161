//! Shared utilities

pub mod checksums;
pub mod config;
pub mod context;
pub mod diagnostic;
pub mod errors;
pub mod filter;
pub mod fs;
pub mod hash;
pub mod process;

pub use config::EnvConfig;
pub use context::GlobalContext;
pub use diagnostic::Diagnostic;
pub use errors::ErrorKind;
