//! Component sources.
//!
//! Sources are responsible for listing and fetching components from the
//! places they live: a registry, a local directory, a git repository or the
//! toolchain itself. [`Source`] dispatches over the four kinds and
//! [`SourceMap`] keeps one instance per [`SourceRef`].

pub mod cache;
pub mod git;
pub mod path;
pub mod registry;
pub mod toolchain;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::core::context::BuildContext;
use crate::core::source_id::SourceRef;
use crate::core::summary::ComponentWithVersions;
use crate::core::version::VersionSpec;
use crate::ops::lockfile::LockedSource;
use crate::resolver::ResolvedComponent;
use crate::util::config::EnvConfig;

pub use cache::ComponentCache;
pub use git::GitSource;
pub use path::LocalSource;
pub use registry::RegistrySource;
pub use toolchain::ToolchainSource;

/// A source of components.
#[derive(Debug)]
pub enum Source {
    Registry(RegistrySource),
    Local(LocalSource),
    Git(GitSource),
    Toolchain(ToolchainSource),
}

impl Source {
    /// Create the source for `source_ref`.
    pub fn new(
        source_ref: &SourceRef,
        cache: &ComponentCache,
        env: &EnvConfig,
        ctx: &BuildContext,
    ) -> Result<Self> {
        Ok(match source_ref {
            SourceRef::Registry { .. } => {
                Source::Registry(RegistrySource::new(source_ref.clone(), cache.clone(), env)?)
            }
            SourceRef::Local { .. } => Source::Local(LocalSource::new(source_ref.clone(), env)?),
            SourceRef::Git { .. } => {
                Source::Git(GitSource::new(source_ref.clone(), cache.clone(), env)?)
            }
            SourceRef::Toolchain => Source::Toolchain(ToolchainSource::new(ctx, env)),
        })
    }

    pub fn source_ref(&self) -> &SourceRef {
        match self {
            Source::Registry(s) => s.source_ref(),
            Source::Local(s) => s.source_ref(),
            Source::Git(s) => s.source_ref(),
            Source::Toolchain(s) => s.source_ref(),
        }
    }

    /// Versions of `name` the solver may consider.
    pub fn versions(
        &self,
        name: &str,
        spec: &VersionSpec,
        target: Option<&str>,
    ) -> Result<ComponentWithVersions> {
        match self {
            Source::Registry(s) => s.versions(name, spec, target),
            Source::Local(s) => s.versions(name, spec, target),
            Source::Git(s) => s.versions(name, spec, target),
            Source::Toolchain(s) => s.versions(name, spec, target),
        }
    }

    /// Make the component available at `dest` and return where it lives.
    ///
    /// Downloadable sources place a verified copy at `dest`; the others
    /// return their own directory.
    pub fn fetch(&self, resolved: &ResolvedComponent, dest: &Path) -> Result<PathBuf> {
        match self {
            Source::Registry(s) => s.fetch(resolved, dest),
            Source::Local(s) => s.fetch(resolved, dest),
            Source::Git(s) => s.fetch(resolved, dest),
            Source::Toolchain(s) => s.fetch(resolved, dest),
        }
    }

    pub fn download_required(&self) -> bool {
        self.source_ref().download_required()
    }

    pub fn hash_key(&self) -> String {
        match self {
            Source::Registry(s) => s.hash_key(),
            Source::Local(s) => s.hash_key(),
            Source::Git(s) => s.hash_key(),
            Source::Toolchain(s) => s.hash_key(),
        }
    }

    /// Lock file representation, with local paths relative to `base` when
    /// possible.
    pub fn serialize(&self, base: &Path) -> LockedSource {
        LockedSource::from_ref(self.source_ref(), base)
    }
}

/// One [`Source`] per [`SourceRef`], created on first use.
#[derive(Debug)]
pub struct SourceMap {
    cache: ComponentCache,
    env: EnvConfig,
    ctx: BuildContext,
    sources: Mutex<HashMap<SourceRef, Arc<Source>>>,
}

impl SourceMap {
    pub fn new(cache: ComponentCache, env: EnvConfig, ctx: BuildContext) -> Self {
        SourceMap {
            cache,
            env,
            ctx,
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the source for `source_ref`.
    pub fn get_or_create(&self, source_ref: &SourceRef) -> Result<Arc<Source>> {
        let mut sources = self
            .sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(source) = sources.get(source_ref) {
            return Ok(Arc::clone(source));
        }

        let source = Arc::new(Source::new(source_ref, &self.cache, &self.env, &self.ctx)?);
        sources.insert(source_ref.clone(), Arc::clone(&source));
        Ok(source)
    }

    pub fn cache(&self) -> &ComponentCache {
        &self.cache
    }

    pub fn env(&self) -> &EnvConfig {
        &self.env
    }

    pub fn build_context(&self) -> &BuildContext {
        &self.ctx
    }
}
