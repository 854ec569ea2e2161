//! Resolution error types and diagnostics.

use thiserror::Error;

use crate::util::diagnostic::{suggestions, Diagnostic};
use crate::util::errors::ErrorKind;

/// Error during dependency resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The solver proved that no solution exists.
    #[error("failed to solve dependencies:\n{report}{}", render_notes(.notes))]
    Unsatisfiable {
        report: String,
        /// Source notes on versions that were left out
        notes: Vec<String>,
    },

    /// The same component was required from two sources of equal priority.
    #[error("component `{name}` is both added as {first} and as {second}")]
    SourceConflict {
        name: String,
        first: String,
        second: String,
    },

    #[error("cycle detected in dependency graph: {}", .components.join(" -> "))]
    CycleDetected { components: Vec<String> },

    #[error("dependency resolution error: {message}")]
    Internal { message: String },
}

fn render_notes(notes: &[String]) -> String {
    notes.iter().map(|n| format!("\nnote: {}", n)).collect()
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::Unsatisfiable { .. }
            | ResolveError::SourceConflict { .. }
            | ResolveError::CycleDetected { .. } => ErrorKind::Unsatisfiable,
            ResolveError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Convert to a user-friendly diagnostic.
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            ResolveError::Unsatisfiable { report, notes } => {
                let mut diag = Diagnostic::error("failed to solve dependencies");
                for line in report.lines().filter(|l| !l.trim().is_empty()) {
                    diag = diag.with_context(line.to_string());
                }
                for note in notes {
                    diag = diag.with_context(note.clone());
                }
                diag.with_suggestion(suggestions::UNSATISFIABLE)
            }

            ResolveError::SourceConflict { name, .. } => Diagnostic::error(self.to_string())
                .with_suggestion(format!(
                    "Declare `{}` once, or give one of the declarations a higher priority source such as `path` or `override_path`",
                    name
                )),

            ResolveError::CycleDetected { .. } => Diagnostic::error(self.to_string())
                .with_suggestion("Break the cycle by removing or restructuring dependencies"),

            ResolveError::Internal { .. } => Diagnostic::error(self.to_string()),
        }
    }
}
