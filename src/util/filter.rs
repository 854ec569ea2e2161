//! File selection for hashing, checksums and validation.
//!
//! Two modes exist. Manifest mode starts from every file under the root,
//! removes paths matched by the exclude globs (default and user supplied)
//! and re-adds paths matched by user include globs. Gitignore mode asks a
//! scratch repository whose work tree is the root which files are ignored.
//!
//! Integrity metadata files are never part of the result.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use git2::Repository;
use thiserror::Error;
use walkdir::WalkDir;

use crate::util::checksums::{CHECKSUMS_FILENAME, COMPONENT_HASH_FILENAME};
use crate::util::errors::ErrorKind;

/// Paths excluded unless `use_default_excludes` is turned off.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.DS_Store",
    "**/.git",
    "**/.svn",
    "**/.hg",
    "**/.idea",
    "**/.vscode",
    "**/.settings",
    "**/.pytest_cache",
    "**/.mypy_cache",
    "**/__pycache__",
    "**/*.pyc",
    "**/*.pyd",
    "**/*.pyo",
    "**/build",
    "**/dist",
    "**/node_modules",
    "**/managed_components",
    "**/dependencies.lock",
    "**/sdkconfig",
    "**/sdkconfig.old",
];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid glob pattern `{pattern}`")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("failed to list files under {}", .root.display())]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("failed to evaluate .gitignore rules under {}", .root.display())]
    Gitignore {
        root: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("failed to create scratch repository")]
    Scratch(#[source] std::io::Error),
}

impl FilterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FilterError::InvalidPattern { .. } => ErrorKind::UserInput,
            _ => ErrorKind::Environment,
        }
    }
}

/// Selection rules for a component directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub use_default_excludes: bool,
    pub use_gitignore: bool,
}

impl Default for FileFilter {
    fn default() -> Self {
        FileFilter {
            include: Vec::new(),
            exclude: Vec::new(),
            use_default_excludes: true,
            use_gitignore: false,
        }
    }
}

impl FileFilter {
    /// Sorted POSIX-style paths of the selected files, relative to `root`.
    pub fn files(&self, root: &Path) -> Result<Vec<String>, FilterError> {
        let all = walk_files(root, self.use_gitignore)?;

        let mut selected = if self.use_gitignore {
            if !self.include.is_empty() || !self.exclude.is_empty() {
                tracing::debug!(
                    "include/exclude globs are ignored when use_gitignore is set ({})",
                    root.display()
                );
            }
            not_gitignored(root, all)?
        } else {
            self.apply_globs(all)?
        };

        selected.retain(|path| !is_hash_file(path));
        Ok(selected.into_iter().collect())
    }

    fn apply_globs(&self, all: Vec<String>) -> Result<BTreeSet<String>, FilterError> {
        let mut exclude = Vec::new();
        if self.use_default_excludes {
            exclude.extend(DEFAULT_EXCLUDES.iter().map(|s| s.to_string()));
        }
        exclude.extend(self.exclude.iter().cloned());

        let exclude = compile(&exclude)?;
        let include = compile(&self.include)?;

        Ok(all
            .into_iter()
            .filter(|path| !matches_any(&exclude, path) || matches_any(&include, path))
            .collect())
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, FilterError> {
    patterns
        .iter()
        .map(|raw| {
            let trimmed = raw.trim_start_matches("./").trim_end_matches('/');
            Pattern::new(trimmed).map_err(|source| FilterError::InvalidPattern {
                pattern: raw.clone(),
                source,
            })
        })
        .collect()
}

/// A path matches when it, or any directory above it, matches a pattern.
fn matches_any(patterns: &[Pattern], path: &str) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let mut end = 0;
    loop {
        let next = path[end..].find('/').map(|i| end + i);
        let candidate = match next {
            Some(i) => &path[..i],
            None => path,
        };
        if patterns
            .iter()
            .any(|p| p.matches_with(candidate, MATCH_OPTIONS))
        {
            return true;
        }
        match next {
            Some(i) => end = i + 1,
            None => return false,
        }
    }
}

fn is_hash_file(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name == COMPONENT_HASH_FILENAME || name == CHECKSUMS_FILENAME
}

fn walk_files(root: &Path, skip_git_dirs: bool) -> Result<Vec<String>, FilterError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(skip_git_dirs && e.depth() > 0 && e.file_name() == ".git"));

    for entry in walker {
        let entry = entry.map_err(|source| FilterError::Walk {
            root: root.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.push(to_posix(rel));
        }
    }
    Ok(files)
}

/// Join path components with `/` regardless of platform.
pub fn to_posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn not_gitignored(root: &Path, files: Vec<String>) -> Result<BTreeSet<String>, FilterError> {
    let git_err = |source| FilterError::Gitignore {
        root: root.to_path_buf(),
        source,
    };

    let scratch = tempfile::tempdir().map_err(FilterError::Scratch)?;
    let repo = Repository::init_bare(scratch.path()).map_err(git_err)?;
    repo.set_workdir(root, false).map_err(git_err)?;

    let mut kept = BTreeSet::new();
    for rel in files {
        if !repo.is_path_ignored(&rel).map_err(git_err)? {
            kept.insert(rel);
        }
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, rel).unwrap();
    }

    #[test]
    fn test_default_excludes() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "src/main.c");
        touch(tmp.path(), ".git/config");
        touch(tmp.path(), "build/out.o");
        touch(tmp.path(), "tools/__pycache__/x.pyc");
        touch(tmp.path(), "dependencies.lock");
        touch(tmp.path(), "idf_component.yml");

        let files = FileFilter::default().files(tmp.path()).unwrap();
        assert_eq!(files, vec!["idf_component.yml", "src/main.c"]);
    }

    #[test]
    fn test_without_default_excludes() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "build/out.o");
        touch(tmp.path(), "CHECKSUMS.json");

        let filter = FileFilter {
            use_default_excludes: false,
            ..FileFilter::default()
        };
        assert_eq!(filter.files(tmp.path()).unwrap(), vec!["build/out.o"]);
    }

    #[test]
    fn test_user_exclude_and_reinclude() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "docs/a.md");
        touch(tmp.path(), "docs/keep.md");
        touch(tmp.path(), "src/lib.c");

        let filter = FileFilter {
            exclude: vec!["docs/".to_string()],
            include: vec!["docs/keep.md".to_string()],
            ..FileFilter::default()
        };
        assert_eq!(
            filter.files(tmp.path()).unwrap(),
            vec!["docs/keep.md", "src/lib.c"]
        );
    }

    #[test]
    fn test_include_can_override_default_exclude() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "build/config.cmake");

        let filter = FileFilter {
            include: vec!["build/*.cmake".to_string()],
            ..FileFilter::default()
        };
        assert_eq!(filter.files(tmp.path()).unwrap(), vec!["build/config.cmake"]);
    }

    #[test]
    fn test_invalid_pattern() {
        let tmp = TempDir::new().unwrap();
        let filter = FileFilter {
            exclude: vec!["[".to_string()],
            ..FileFilter::default()
        };
        let err = filter.files(tmp.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserInput);
    }

    #[test]
    fn test_gitignore_mode() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "src/main.c");
        touch(tmp.path(), "build/out.o");
        touch(tmp.path(), "secret.key");
        fs::write(tmp.path().join(".gitignore"), "*.key\n").unwrap();

        let filter = FileFilter {
            use_gitignore: true,
            ..FileFilter::default()
        };
        let files = filter.files(tmp.path()).unwrap();
        // default excludes do not apply in this mode
        assert_eq!(files, vec![".gitignore", "build/out.o", "src/main.c"]);
    }
}
