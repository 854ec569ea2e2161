//! User-facing diagnostic messages.
//!
//! Every rendered error names the failure, lists the causes it was wrapped
//! with and, where one exists, a concrete next step.

use std::fmt;
use std::path::PathBuf;

use crate::util::errors::{classify, ErrorKind};

/// Common suggestion messages for consistent error handling.
pub mod suggestions {
    pub const UNSATISFIABLE: &str =
        "Relax the version constraints in idf_component.yml or remove dependencies.lock";

    pub const NOT_FOUND: &str =
        "Check the component name and namespace, or set IDF_COMPONENT_REGISTRY_URL";

    pub const INTEGRITY: &str = "Revert the local changes, or set \
        IDF_COMPONENT_OVERWRITE_MANAGED_COMPONENTS=1 to download the component again";

    pub const NETWORK: &str = "Check your network connection and the registry URL";

    pub const GIT: &str = "Install git 2.13 or newer and make sure it is in PATH";
}

/// Severity level for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// A diagnostic message with optional suggestions.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Primary message
    pub message: String,
    pub severity: Severity,
    /// Additional context lines
    pub context: Vec<String>,
    /// Suggested fixes
    pub suggestions: Vec<String>,
    /// Related location (file path)
    pub location: Option<PathBuf>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            message: message.into(),
            severity: Severity::Error,
            context: Vec::new(),
            suggestions: Vec::new(),
            location: None,
        }
    }

    /// Create a new warning diagnostic.
    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            ..Diagnostic::error(message)
        }
    }

    /// Build an error diagnostic from an error chain.
    ///
    /// The outermost message becomes the headline and every underlying
    /// cause a context line.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let mut diag = Diagnostic::error(err.to_string());
        for cause in err.chain().skip(1) {
            diag = diag.with_context(cause.to_string());
        }

        let suggestion = match classify(err) {
            ErrorKind::Unsatisfiable => Some(suggestions::UNSATISFIABLE),
            ErrorKind::NotFound => Some(suggestions::NOT_FOUND),
            ErrorKind::Integrity => Some(suggestions::INTEGRITY),
            ErrorKind::Network => Some(suggestions::NETWORK),
            ErrorKind::Environment if is_git_error(err) => Some(suggestions::GIT),
            _ => None,
        };
        if let Some(s) = suggestion {
            diag = diag.with_suggestion(s);
        }
        diag
    }

    /// Add context to the diagnostic.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context.push(context.into());
        self
    }

    /// Add a suggestion for fixing the issue.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Add a file location.
    pub fn with_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.location = Some(path.into());
        self
    }

    /// Format the diagnostic for terminal output.
    pub fn format(&self, color: bool) -> String {
        let mut output = String::new();

        let severity_str = match (color, self.severity) {
            (true, Severity::Error) => "\x1b[1;31merror\x1b[0m",
            (true, Severity::Warning) => "\x1b[1;33mwarning\x1b[0m",
            (false, Severity::Error) => "error",
            (false, Severity::Warning) => "warning",
        };

        output.push_str(&format!("{}: {}\n", severity_str, self.message));

        if let Some(ref path) = self.location {
            output.push_str(&format!("  --> {}\n", path.display()));
        }

        for ctx in &self.context {
            for (i, line) in ctx.lines().enumerate() {
                let bullet = if i == 0 { "caused by:" } else { "          " };
                output.push_str(&format!("  {} {}\n", bullet, line));
            }
        }

        if !self.suggestions.is_empty() {
            output.push('\n');
            let help_prefix = if color {
                "\x1b[1;32mhelp\x1b[0m"
            } else {
                "help"
            };
            for suggestion in &self.suggestions {
                output.push_str(&format!("{}: {}\n", help_prefix, suggestion));
            }
        }

        output
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format(false))
    }
}

fn is_git_error(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|c| c.downcast_ref::<crate::sources::git::GitError>().is_some())
}

/// Print a diagnostic to stderr.
pub fn emit(diagnostic: &Diagnostic, color: bool) {
    eprint!("{}", diagnostic.format(color));
}
