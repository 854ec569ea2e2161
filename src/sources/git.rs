//! Git source - components from git repositories.
//!
//! Every repository gets one working copy in the cache
//! (`<cache>/git~<sha256(url)>`) that is driven with the `git` executable:
//!
//! ```text
//! Uninit -> Inited -> Fetched -> CheckedOut -> SubmodulesUpdated
//! ```
//!
//! A failed step leaves the working copy in place for inspection.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use thiserror::Error;

use crate::core::manifest::{component_filter, Manifest, MANIFEST_FILENAME};
use crate::core::source_id::SourceRef;
use crate::core::summary::{ComponentVersion, ComponentWithVersions};
use crate::core::version::{is_commit_id, Version, VersionSpec};
use crate::resolver::ResolvedComponent;
use crate::sources::cache::ComponentCache;
use crate::util::checksums::IntegrityError;
use crate::util::config::EnvConfig;
use crate::util::errors::ErrorKind;
use crate::util::fs::{ensure_dir, replace_dir};
use crate::util::hash::{hash_dir, hash_url, sha256_str};
use crate::util::process::{find_executable, ProcessBuilder, ProcessTimeout};

/// Oldest git that supports everything used here.
const MIN_GIT_VERSION: (u64, u64) = (2, 13);

const GIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git executable not found in PATH")]
    NotInstalled,

    #[error("git {found} is too old; version 2.13 or newer is required")]
    TooOld { found: String },

    #[error("cannot parse git version from `{output}`")]
    UnknownVersion { output: String },

    #[error("git {step} failed for {repo}{}: {message}", fmt_ref(.reference))]
    Command {
        step: GitState,
        repo: String,
        reference: Option<String>,
        message: String,
    },

    #[error("git {step} timed out for {repo}")]
    Timeout { step: GitState, repo: String },

    #[error("reference `{reference}` not found in {repo}")]
    RefNotFound { repo: String, reference: String },

    #[error("path `{path}` does not exist in {repo} at {commit}")]
    PathNotFound {
        repo: String,
        path: String,
        commit: String,
    },
}

fn fmt_ref(reference: &Option<String>) -> String {
    match reference {
        Some(r) => format!(" (ref `{}`)", r),
        None => String::new(),
    }
}

impl GitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GitError::NotInstalled | GitError::TooOld { .. } | GitError::UnknownVersion { .. } => {
                ErrorKind::Environment
            }
            GitError::Command {
                step: GitState::Inited | GitState::Fetched,
                ..
            }
            | GitError::Timeout { .. } => ErrorKind::Network,
            GitError::Command { .. } => ErrorKind::Environment,
            GitError::RefNotFound { .. } | GitError::PathNotFound { .. } => ErrorKind::NotFound,
        }
    }
}

/// Preparation states of a working copy. Each names the step that
/// produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GitState {
    Uninit,
    Inited,
    Fetched,
    CheckedOut,
    SubmodulesUpdated,
}

impl fmt::Display for GitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GitState::Uninit => "uninit",
            GitState::Inited => "init",
            GitState::Fetched => "fetch",
            GitState::CheckedOut => "checkout",
            GitState::SubmodulesUpdated => "submodule update",
        })
    }
}

/// Parse `git version 2.39.2 (Apple Git-143)` into (major, minor).
pub fn parse_git_version(output: &str) -> Option<(u64, u64)> {
    static VERSION: OnceLock<Option<Regex>> = OnceLock::new();
    let re = VERSION
        .get_or_init(|| Regex::new(r"git version (\d+)\.(\d+)").ok())
        .as_ref()?;
    let caps = re.captures(output)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// The `git` executable, checked once per process.
fn git_executable() -> Result<PathBuf, GitError> {
    static GIT: OnceLock<Result<PathBuf, String>> = OnceLock::new();
    let found = GIT.get_or_init(|| {
        let git = find_executable("git").ok_or_else(String::new)?;
        let output = ProcessBuilder::new(&git)
            .arg("--version")
            .exec()
            .map_err(|_| String::new())?;
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        match parse_git_version(&text) {
            Some(version) if version >= MIN_GIT_VERSION => Ok(git),
            Some(_) => Err(text),
            None => Err(format!("?{}", text)),
        }
    });

    match found {
        Ok(git) => Ok(git.clone()),
        Err(text) if text.is_empty() => Err(GitError::NotInstalled),
        Err(text) => match text.strip_prefix('?') {
            Some(output) => Err(GitError::UnknownVersion {
                output: output.to_string(),
            }),
            None => Err(GitError::TooOld {
                found: text.trim_start_matches("git version ").to_string(),
            }),
        },
    }
}

/// A source for git dependencies.
#[derive(Debug)]
pub struct GitSource {
    source_ref: SourceRef,
    repo: String,
    path: Option<String>,
    reference: Option<String>,
    cache: ComponentCache,
    env: EnvConfig,

    /// Serializes use of the working copy
    working_copy: Mutex<()>,
}

impl GitSource {
    pub fn new(source_ref: SourceRef, cache: ComponentCache, env: &EnvConfig) -> Result<Self> {
        let SourceRef::Git {
            repo,
            path,
            reference,
        } = &source_ref
        else {
            anyhow::bail!("not a git source: {}", source_ref);
        };

        Ok(GitSource {
            repo: repo.clone(),
            path: path.clone(),
            reference: reference.clone(),
            source_ref,
            cache,
            env: env.clone(),
            working_copy: Mutex::new(()),
        })
    }

    pub fn source_ref(&self) -> &SourceRef {
        &self.source_ref
    }

    /// sha256 of the normalized repository URL.
    pub fn hash_key(&self) -> String {
        hash_url(&self.repo).unwrap_or_else(|_| sha256_str(&self.repo))
    }

    fn repo_dir(&self) -> PathBuf {
        self.cache.git_repo_path(&self.hash_key())
    }

    /// The single version at the requested ref: its commit id.
    pub fn versions(
        &self,
        name: &str,
        spec: &VersionSpec,
        target: Option<&str>,
    ) -> Result<ComponentWithVersions> {
        let reference = match spec {
            VersionSpec::Commit(commit) => Some(commit.as_str()),
            _ => self.reference.as_deref(),
        };

        let _guard = self.lock_working_copy();
        let _cache_lock = self.cache.lock()?;
        let commit = self.prepare(reference)?;
        let dir = self.component_dir(&commit)?;

        let manifest = if dir.join(MANIFEST_FILENAME).is_file() {
            Some(Manifest::load_dir(&dir, &self.env)?)
        } else {
            None
        };
        let filter = manifest
            .as_ref()
            .map(|m| m.filter.clone())
            .unwrap_or_default();
        let hash = hash_dir(&dir, &filter)?;

        let mut result = ComponentWithVersions::new(name, Vec::new());
        let (dependencies, targets) = match manifest {
            Some(m) => (m.dependencies, m.targets),
            None => (Vec::new(), Vec::new()),
        };
        let candidate = ComponentVersion::new(Version::Commit(commit.clone()), dependencies)
            .with_hash(Some(hash))
            .with_targets(targets);

        match target {
            Some(target) if !candidate.supports_target(target) => {
                result.reject_target(candidate.version(), candidate.targets());
            }
            _ => result.versions.push(candidate),
        }
        Ok(result)
    }

    /// Check out the resolved commit and copy the component to `dest`.
    pub fn fetch(&self, resolved: &ResolvedComponent, dest: &Path) -> Result<PathBuf> {
        let commit = match &resolved.version {
            Version::Commit(commit) => commit.clone(),
            other => anyhow::bail!("git component {} has non-commit version {}", resolved.name, other),
        };

        let _guard = self.lock_working_copy();
        let _cache_lock = self.cache.lock()?;
        self.prepare(Some(&commit))?;
        let dir = self.component_dir(&commit)?;

        let filter = component_filter(&dir)?;

        let staging = tempfile::tempdir().context("failed to create staging directory")?;
        for rel in filter.files(&dir)? {
            let target = staging.path().join(&rel);
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            std::fs::copy(dir.join(&rel), &target)
                .with_context(|| format!("failed to copy {} from {}", rel, self.repo))?;
        }

        if let Some(expected) = &resolved.component_hash {
            let actual = hash_dir(staging.path(), &filter)?;
            if &actual != expected {
                return Err(IntegrityError::HashMismatch {
                    dir: dir.clone(),
                    expected: expected.clone(),
                    actual,
                })
                .with_context(|| format!("content of {} at {} changed", self.repo, commit));
            }
        }

        replace_dir(staging.path(), dest)?;
        tracing::info!(
            "fetched {} from {} at {}",
            resolved.name,
            self.repo,
            commit.get(..8).unwrap_or(&commit)
        );
        Ok(dest.to_path_buf())
    }

    fn lock_working_copy(&self) -> std::sync::MutexGuard<'_, ()> {
        self.working_copy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn component_dir(&self, commit: &str) -> Result<PathBuf, GitError> {
        let root = self.repo_dir();
        match &self.path {
            None => Ok(root),
            Some(path) => {
                let dir = root.join(path);
                if dir.is_dir() {
                    Ok(dir)
                } else {
                    Err(GitError::PathNotFound {
                        repo: self.repo.clone(),
                        path: path.clone(),
                        commit: commit.to_string(),
                    })
                }
            }
        }
    }

    /// Drive the working copy to `reference` and return its commit id.
    fn prepare(&self, reference: Option<&str>) -> Result<String> {
        let git = git_executable()?;
        let dir = self.repo_dir();
        let mut state = GitState::Uninit;

        if dir.join(".git").is_dir() {
            state = GitState::Inited;
        } else {
            ensure_dir(&dir)?;
            self.run(&git, &dir, GitState::Inited, reference, &["init", "--quiet"])?;
            self.run(
                &git,
                &dir,
                GitState::Inited,
                reference,
                &["remote", "add", "origin", &self.repo],
            )?;
            state = self.advance(state, GitState::Inited);
        }

        let reference = match reference {
            Some(r) => r.to_string(),
            None => self.remote_head(&git, &dir)?,
        };

        self.run(
            &git,
            &dir,
            GitState::Fetched,
            Some(&reference),
            &[
                "fetch",
                "--quiet",
                "--force",
                "--prune",
                "--tags",
                "origin",
                "+refs/heads/*:refs/remotes/origin/*",
            ],
        )?;
        state = self.advance(state, GitState::Fetched);

        let commit = self.rev_parse(&git, &dir, &reference)?;

        self.run(
            &git,
            &dir,
            GitState::CheckedOut,
            Some(&reference),
            &["checkout", "--quiet", "--force", "--detach", &commit],
        )?;
        self.run(
            &git,
            &dir,
            GitState::CheckedOut,
            Some(&reference),
            &["reset", "--quiet", "--hard", &commit],
        )?;
        state = self.advance(state, GitState::CheckedOut);

        self.run(
            &git,
            &dir,
            GitState::SubmodulesUpdated,
            Some(&reference),
            &["submodule", "update", "--init", "--recursive"],
        )?;
        self.advance(state, GitState::SubmodulesUpdated);

        Ok(commit)
    }

    fn advance(&self, from: GitState, to: GitState) -> GitState {
        tracing::debug!("{}: {:?} -> {:?}", self.repo, from, to);
        to
    }

    /// Commit of the remote's default branch.
    fn remote_head(&self, git: &Path, dir: &Path) -> Result<String> {
        let output = self.run(git, dir, GitState::Fetched, None, &["ls-remote", "origin", "HEAD"])?;
        output
            .split_whitespace()
            .next()
            .filter(|sha| is_commit_id(sha))
            .map(str::to_string)
            .ok_or_else(|| {
                GitError::RefNotFound {
                    repo: self.repo.clone(),
                    reference: "HEAD".to_string(),
                }
                .into()
            })
    }

    fn rev_parse(&self, git: &Path, dir: &Path, reference: &str) -> Result<String> {
        let mut candidates = vec![format!("origin/{}", reference), reference.to_string()];
        if is_commit_id(reference) {
            candidates.reverse();
        }

        for candidate in &candidates {
            let output = ProcessBuilder::new(git)
                .cwd(dir)
                .args(["rev-parse", "--verify", "--quiet"])
                .arg(format!("{}^{{commit}}", candidate))
                .timeout(GIT_TIMEOUT)
                .exec()?;
            if output.status.success() {
                let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if is_commit_id(&sha) {
                    return Ok(sha);
                }
            }
        }

        // A commit not reachable from any branch can still be fetched by id.
        if is_commit_id(reference) {
            self.run(
                git,
                dir,
                GitState::Fetched,
                Some(reference),
                &["fetch", "--quiet", "origin", reference],
            )?;
            return Ok(reference.to_string());
        }

        Err(GitError::RefNotFound {
            repo: self.repo.clone(),
            reference: reference.to_string(),
        }
        .into())
    }

    fn run(
        &self,
        git: &Path,
        dir: &Path,
        step: GitState,
        reference: Option<&str>,
        args: &[&str],
    ) -> Result<String> {
        let output = ProcessBuilder::new(git)
            .cwd(dir)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(GIT_TIMEOUT)
            .exec()
            .map_err(|err| {
                if err.downcast_ref::<ProcessTimeout>().is_some() {
                    GitError::Timeout {
                        step,
                        repo: self.repo.clone(),
                    }
                    .into()
                } else {
                    err
                }
            })?;

        if !output.status.success() {
            return Err(GitError::Command {
                step,
                repo: self.repo.clone(),
                reference: reference.map(str::to_string),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_parse_git_version() {
        assert_eq!(parse_git_version("git version 2.39.2"), Some((2, 39)));
        assert_eq!(
            parse_git_version("git version 2.13.0.windows.1"),
            Some((2, 13))
        );
        assert_eq!(parse_git_version("git version 1.9.5 (Apple Git-50)"), Some((1, 9)));
        assert_eq!(parse_git_version("not git"), None);
        assert!((1, 9) < MIN_GIT_VERSION);
        assert!((2, 13) >= MIN_GIT_VERSION);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(GitError::NotInstalled.kind(), ErrorKind::Environment);
        let fetch = GitError::Command {
            step: GitState::Fetched,
            repo: "r".into(),
            reference: Some("main".into()),
            message: "could not resolve host".into(),
        };
        assert_eq!(fetch.kind(), ErrorKind::Network);
        assert!(fetch.to_string().contains("main"));
        assert!(fetch.to_string().contains("fetch"));
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = ProcessBuilder::new("git")
            .cwd(dir)
            .args(args)
            .env("GIT_AUTHOR_NAME", "t")
            .env("GIT_AUTHOR_EMAIL", "t@example.com")
            .env("GIT_COMMITTER_NAME", "t")
            .env("GIT_COMMITTER_EMAIL", "t@example.com")
            .exec_and_check()
            .unwrap();
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// A repository with `lib/foo` in two commits. Returns (url, first, second).
    fn upstream(tmp: &Path) -> (String, String, String) {
        let repo = tmp.join("upstream");
        fs::create_dir_all(repo.join("lib/foo")).unwrap();
        git(&repo, &["init", "--quiet"]);
        fs::write(repo.join("lib/foo/idf_component.yml"), "version: 1.0.0\n").unwrap();
        fs::write(repo.join("lib/foo/foo.c"), "int foo = 1;").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "--quiet", "-m", "one"]);
        let first = git(&repo, &["rev-parse", "HEAD"]);

        fs::write(repo.join("lib/foo/foo.c"), "int foo = 2;").unwrap();
        git(&repo, &["commit", "--quiet", "-am", "two"]);
        let second = git(&repo, &["rev-parse", "HEAD"]);

        (repo.display().to_string(), first, second)
    }

    #[test]
    fn test_pinned_commit_and_default_branch() {
        if git_executable().is_err() {
            eprintln!("skipping: git 2.13+ not available");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let (url, first, second) = upstream(tmp.path());
        let cache = ComponentCache::new(tmp.path().join("cache"));
        let env = EnvConfig::default();

        let pinned = GitSource::new(SourceRef::git(&url, Some("lib/foo"), Some(&first)), cache.clone(), &env)
            .unwrap();
        let versions = pinned
            .versions("foo", &VersionSpec::Commit(first.clone()), None)
            .unwrap();
        assert_eq!(versions.versions[0].version(), &Version::Commit(first.clone()));

        let resolved = ResolvedComponent::new("foo", Version::Commit(first.clone()), pinned.source_ref().clone())
            .with_hash(versions.versions[0].component_hash().map(str::to_string));
        let dest = tmp.path().join("managed/foo");
        pinned.fetch(&resolved, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("foo.c")).unwrap(), "int foo = 1;");
        assert!(!dest.join(".git").exists());

        let head = GitSource::new(SourceRef::git(&url, Some("lib/foo"), None), cache, &env).unwrap();
        let versions = head.versions("foo", &VersionSpec::any(), None).unwrap();
        assert_eq!(versions.versions[0].version(), &Version::Commit(second));
    }

    #[test]
    fn test_missing_path() {
        if git_executable().is_err() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let (url, first, _) = upstream(tmp.path());
        let src = GitSource::new(
            SourceRef::git(&url, Some("lib/bar"), Some(&first)),
            ComponentCache::new(tmp.path().join("cache")),
            &EnvConfig::default(),
        )
        .unwrap();

        let err = src.versions("bar", &VersionSpec::any(), None).unwrap_err();
        assert_eq!(crate::util::errors::classify(&err), ErrorKind::NotFound);
    }
}
