//! Implementation of `compote prepare`.
//!
//! Resolves the project's dependencies, materializes every downloadable
//! component under `managed_components/` and writes `dependencies.lock`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::prelude::*;

use crate::core::context::BuildContext;
use crate::core::dependency::Requirement;
use crate::core::manifest::{component_filter, Manifest, MANIFEST_FILENAME};
use crate::core::name::{self, TOOLCHAIN_NAME};
use crate::core::source_id::SourceRef;
use crate::core::version::VersionSpec;
use crate::ops::lockfile::{LockFile, LOCK_FILENAME};
use crate::ops::version_check;
use crate::resolver::{Resolve, ResolvedComponent, Resolver};
use crate::sources::{ComponentCache, SourceMap};
use crate::util::checksums::{
    has_metadata, read_component_hash, validate_dir, write_integrity, IntegrityError,
};
use crate::util::errors::EnvironmentError;
use crate::util::fs::{ensure_dir, remove_dir_all_if_exists};
use crate::util::hash::hash_dir;
use crate::util::GlobalContext;

pub const MANAGED_COMPONENTS_DIR: &str = "managed_components";

/// Upper bound on concurrent fetches.
const MAX_JOBS: usize = 8;

/// Shared flag checked between components and before each download.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(EnvironmentError::Cancelled.into());
        }
        Ok(())
    }
}

/// Options for [`prepare`].
#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    /// Project manifest (default: `main/idf_component.yml`, then
    /// `idf_component.yml` in the project root)
    pub manifest_path: Option<PathBuf>,

    /// Lock file (default: `dependencies.lock` in the project root)
    pub lock_path: Option<PathBuf>,

    /// Overrides `IDF_TARGET`
    pub target: Option<String>,

    /// Overrides `IDF_VERSION`
    pub idf_version: Option<String>,

    /// Kconfig values for `$CONFIG{..}` rules
    pub sdkconfig_json: Option<PathBuf>,

    /// Number of parallel fetches (default: logical CPUs, at most 8)
    pub jobs: Option<usize>,

    /// Show a progress bar while fetching
    pub progress: bool,

    pub cancel: CancelToken,
}

/// Outcome of [`prepare`].
#[derive(Debug)]
pub struct PrepareResult {
    pub resolve: Resolve,
    pub lock_path: PathBuf,
    /// The existing lock was used without solving
    pub lock_reused: bool,
    /// The lock file was created or changed
    pub lock_written: bool,
    /// Directory to build each component from, by name
    pub component_paths: BTreeMap<String, PathBuf>,
    /// Stale managed component directories that were deleted
    pub removed: Vec<PathBuf>,
}

/// How managed component directories are checked.
#[derive(Debug, Clone, Copy)]
struct IntegrityPolicy {
    strict: bool,
    overwrite: bool,
}

/// What was found in a managed component directory.
#[derive(Debug)]
enum ManagedState {
    Missing,
    /// Content matches its metadata and the locked hash
    Valid,
    /// Unmodified, but holds another version
    Outdated,
    /// Content no longer matches its own metadata
    Modified(anyhow::Error),
    /// No integrity metadata at all
    Unverified,
}

/// Resolve, fetch and lock the dependencies of the project at `project_dir`.
pub fn prepare(
    project_dir: &Path,
    gctx: &GlobalContext,
    opts: &PrepareOptions,
) -> Result<PrepareResult> {
    let env = gctx.env();
    let project_dir = crate::util::fs::normalize_path(&gctx.cwd().join(project_dir));

    let mut ctx =
        BuildContext::from_env(env, opts.target.as_deref(), opts.idf_version.as_deref())?;
    if let Some(path) = &opts.sdkconfig_json {
        ctx = ctx.load_kconfig_json(path)?;
    }

    let manifest = load_project_manifest(&project_dir, opts.manifest_path.as_deref(), gctx)?;
    manifest.check_target(&ctx.target)?;
    tracing::debug!("manifest hash {}", manifest.manifest_hash);

    let lock_path = opts
        .lock_path
        .clone()
        .unwrap_or_else(|| project_dir.join(LOCK_FILENAME));
    let managed_root = project_dir.join(MANAGED_COMPONENTS_DIR);
    let policy = IntegrityPolicy {
        strict: env.strict_checksum(),
        overwrite: env.overwrite_managed_components(),
    };

    let sources = SourceMap::new(
        ComponentCache::new(gctx.cache_root()),
        env.clone(),
        ctx.clone(),
    );

    let previous = LockFile::load(&lock_path)?;
    let locked = match &previous {
        Some(lock) => Some(lock.to_resolve(&project_dir)?),
        None => None,
    };

    let reusable = match (&previous, &locked) {
        (Some(lock), Some(resolve)) if lock.is_fresh(&manifest.manifest_hash, &ctx.target) => {
            lock_is_intact(resolve, &managed_root, policy)?
        }
        (Some(_), _) => {
            tracing::info!("manifest or target changed, solving dependencies");
            false
        }
        _ => {
            tracing::info!("no lock file found, solving dependencies");
            false
        }
    };

    let resolve = if reusable {
        tracing::info!("using {}", lock_path.display());
        locked.clone().unwrap_or_default()
    } else {
        opts.cancel.check()?;
        let mut resolver = Resolver::new(&sources, &ctx, root_requirements(&manifest))
            .with_project_components(project_components(&project_dir, gctx)?);
        if let Some(locked) = &locked {
            resolver = resolver.with_locked(locked);
        }
        resolver.resolve()?
    };

    let component_paths = materialize_all(&sources, &resolve, &managed_root, policy, opts)?;
    let removed = remove_stale(&resolve, &managed_root)?;

    let lock = LockFile::from_resolve(&resolve, &manifest.manifest_hash, &ctx.target, &project_dir);
    let lock_written = previous.as_ref() != Some(&lock);
    if lock_written {
        lock.save(&lock_path)?;
        tracing::info!("updated {}", lock_path.display());
    }

    if env.check_new_version() {
        for warning in version_check::check(&sources, &resolve, gctx.cache_root()) {
            tracing::warn!("{}", warning);
        }
    }

    Ok(PrepareResult {
        resolve,
        lock_path,
        lock_reused: reusable,
        lock_written,
        component_paths,
        removed,
    })
}

/// Load the project manifest. A project without one has no dependencies
/// besides the toolchain.
fn load_project_manifest(
    project_dir: &Path,
    explicit: Option<&Path>,
    gctx: &GlobalContext,
) -> Result<Manifest> {
    if let Some(path) = explicit {
        return Manifest::load(&gctx.cwd().join(path), gctx.env());
    }

    let candidates = [
        project_dir.join("main").join(MANIFEST_FILENAME),
        project_dir.join(MANIFEST_FILENAME),
    ];
    match candidates.iter().find(|p| p.is_file()) {
        Some(path) => Manifest::load(path, gctx.env()),
        None => {
            tracing::debug!("no manifest in {}", project_dir.display());
            let path = &candidates[0];
            Manifest::parse("", path, project_dir, gctx.env())
        }
    }
}

/// The manifest's dependencies plus the implicit toolchain requirement.
fn root_requirements(manifest: &Manifest) -> Vec<Requirement> {
    let mut root = manifest.dependencies.clone();
    if !root.iter().any(|r| r.name == TOOLCHAIN_NAME) {
        root.push(Requirement::toolchain(VersionSpec::any()));
    }
    root
}

/// Components under `<project>/components/` that carry a manifest.
fn project_components(
    project_dir: &Path,
    gctx: &GlobalContext,
) -> Result<BTreeMap<String, SourceRef>> {
    let dir = project_dir.join("components");
    let mut components = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(components);
    }

    let entries = std::fs::read_dir(&dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if !path.join(MANIFEST_FILENAME).is_file() {
            continue;
        }
        let manifest = Manifest::load_dir(&path, gctx.env())?;
        let name = match &manifest.name {
            Some(name) => name::normalize(name),
            None => match path.file_name() {
                Some(dir_name) => name::normalize(&dir_name.to_string_lossy()),
                None => continue,
            },
        };
        tracing::debug!("project component `{}` at {}", name, path.display());
        components.insert(name, SourceRef::local(&path));
    }
    Ok(components)
}

fn inspect(dir: &Path, expected: Option<&str>) -> Result<ManagedState> {
    if !dir.is_dir() {
        return Ok(ManagedState::Missing);
    }
    if !has_metadata(dir) {
        return Ok(ManagedState::Unverified);
    }

    let filter = component_filter(dir)?;
    match validate_dir(dir, &filter, None) {
        Ok(()) => {}
        Err(err) if err.downcast_ref::<IntegrityError>().is_some() => {
            return Ok(ManagedState::Modified(err));
        }
        Err(err) => return Err(err),
    }

    let stored = match read_component_hash(dir)? {
        Some(hash) => hash,
        None => hash_dir(dir, &filter)?,
    };
    Ok(match expected {
        Some(expected) if expected != stored => ManagedState::Outdated,
        _ => ManagedState::Valid,
    })
}

/// Whether every component of a fresh lock is already in place.
fn lock_is_intact(resolve: &Resolve, managed_root: &Path, policy: IntegrityPolicy) -> Result<bool> {
    for component in resolve.components() {
        let intact = match &component.source {
            SourceRef::Toolchain => true,
            SourceRef::Local { path } => path.is_dir(),
            source if source.download_required() => {
                let dir = managed_root.join(component.build_name());
                match inspect(&dir, component.component_hash.as_deref())? {
                    ManagedState::Valid => true,
                    ManagedState::Unverified => !policy.strict && !policy.overwrite,
                    _ => false,
                }
            }
            _ => true,
        };
        if !intact {
            tracing::info!("`{}` needs to be fetched again", component.name);
            return Ok(false);
        }
    }
    Ok(true)
}

/// Decide whether a managed directory must be (re)fetched.
fn needs_fetch(
    component: &ResolvedComponent,
    dir: &Path,
    state: ManagedState,
    policy: IntegrityPolicy,
) -> Result<bool> {
    match state {
        ManagedState::Missing | ManagedState::Outdated => Ok(true),
        ManagedState::Valid => Ok(false),
        ManagedState::Modified(err) => {
            if policy.strict && !policy.overwrite {
                return Err(err.context(format!(
                    "managed component `{}` at {} was modified",
                    component.name,
                    dir.display()
                )));
            }
            tracing::warn!(
                "managed component `{}` was modified ({:#}); fetching it again",
                component.name,
                err
            );
            Ok(true)
        }
        ManagedState::Unverified => {
            if policy.overwrite {
                return Ok(true);
            }
            if policy.strict {
                return Err(anyhow::Error::new(IntegrityError::HashNotFound {
                    dir: dir.to_path_buf(),
                })
                .context(format!("cannot verify managed component `{}`", component.name)));
            }
            tracing::warn!(
                "managed component `{}` at {} has no integrity metadata; keeping it as is",
                component.name,
                dir.display()
            );
            Ok(false)
        }
    }
}

/// Make one component available and return the directory to build from.
fn materialize(
    sources: &SourceMap,
    component: &ResolvedComponent,
    managed_root: &Path,
    policy: IntegrityPolicy,
    cancel: &CancelToken,
) -> Result<Option<PathBuf>> {
    cancel.check()?;
    if component.source == SourceRef::Toolchain {
        return Ok(sources.env().idf_path());
    }

    let source = sources.get_or_create(&component.source)?;
    let dest = managed_root.join(component.build_name());
    if !source.download_required() {
        return source.fetch(component, &dest).map(Some);
    }

    let state = inspect(&dest, component.component_hash.as_deref())?;
    if !needs_fetch(component, &dest, state, policy)? {
        tracing::debug!("`{}` is up to date", component.name);
        return Ok(Some(dest));
    }

    cancel.check()?;
    source
        .fetch(component, &dest)
        .with_context(|| format!("failed to fetch `{}` {}", component.name, component.version))?;
    let hash = write_integrity(&dest, &component_filter(&dest)?)?;
    if let Some(expected) = &component.component_hash {
        if &hash != expected {
            return Err(IntegrityError::HashMismatch {
                dir: dest,
                expected: expected.clone(),
                actual: hash,
            }
            .into());
        }
    }
    tracing::info!("fetched {} {}", component.name, component.version);
    Ok(Some(dest))
}

fn materialize_all(
    sources: &SourceMap,
    resolve: &Resolve,
    managed_root: &Path,
    policy: IntegrityPolicy,
    opts: &PrepareOptions,
) -> Result<BTreeMap<String, PathBuf>> {
    let order = resolve.topological_order()?;
    if order.iter().any(|c| c.source.download_required()) {
        ensure_dir(managed_root)?;
    }

    let jobs = opts
        .jobs
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
        .clamp(1, MAX_JOBS);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .context("failed to start fetch workers")?;

    let progress = progress_bar(order.len() as u64, opts.progress);
    let results: Vec<(String, Result<Option<PathBuf>>)> = pool.install(|| {
        order
            .par_iter()
            .map(|component| {
                progress.set_message(component.name.clone());
                let result = materialize(sources, component, managed_root, policy, &opts.cancel);
                progress.inc(1);
                (component.name.clone(), result)
            })
            .collect()
    });
    progress.finish_and_clear();

    let mut paths = BTreeMap::new();
    for (name, result) in results {
        if let Some(path) = result? {
            paths.insert(name, path);
        }
    }
    Ok(paths)
}

fn progress_bar(len: u64, visible: bool) -> ProgressBar {
    if !visible || len < 2 {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::with_draw_target(Some(len), ProgressDrawTarget::stderr());
    let template = "{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}";
    if let Ok(style) = ProgressStyle::default_bar().template(template) {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar
}

/// Delete managed directories that are no longer part of the solution.
///
/// Only directories carrying integrity metadata are touched; anything else
/// was put there by hand.
fn remove_stale(resolve: &Resolve, managed_root: &Path) -> Result<Vec<PathBuf>> {
    if !managed_root.is_dir() {
        return Ok(Vec::new());
    }

    let wanted: BTreeSet<String> = resolve
        .components()
        .filter(|c| c.source.download_required())
        .map(|c| c.build_name())
        .collect();

    let mut removed = Vec::new();
    let entries = std::fs::read_dir(managed_root)
        .with_context(|| format!("failed to read directory {}", managed_root.display()))?;
    for entry in entries {
        let path = entry?.path();
        let file_name = entry_name(&path);
        if !path.is_dir() || wanted.contains(&file_name) {
            continue;
        }
        if has_metadata(&path) {
            remove_dir_all_if_exists(&path)?;
            tracing::info!("removed unused component {}", path.display());
            removed.push(path);
        } else {
            tracing::warn!("leaving unknown directory {} in place", path.display());
        }
    }
    removed.sort();
    Ok(removed)
}

fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::version::Version;
    use crate::ops::lockfile::LockedSource;
    use crate::test_support::{ComponentBuilder, FakeRegistry, ProjectFixture};
    use crate::util::config::{
        EnvConfig, ENV_CACHE_PATH, ENV_CHECK_NEW_VERSION, ENV_OVERWRITE_MANAGED,
        ENV_REGISTRY_URL, ENV_STRICT_CHECKSUM,
    };
    use crate::util::errors::{classify, ErrorKind};
    use std::fs;
    use tempfile::TempDir;

    struct Project {
        tmp: TempDir,
        registry: FakeRegistry,
    }

    impl Project {
        fn new(publish: impl FnOnce(&FakeRegistry)) -> Self {
            let registry = FakeRegistry::start();
            publish(&registry);
            registry.serve();
            Project {
                tmp: TempDir::new().unwrap(),
                registry,
            }
        }

        fn root(&self) -> PathBuf {
            self.tmp.path().join("project")
        }

        fn write(&self, fixture: ProjectFixture) {
            fixture.write_to(&self.root()).unwrap();
        }

        fn env(&self) -> EnvConfig {
            EnvConfig::default()
                .with_var(ENV_REGISTRY_URL, self.registry.url())
                .with_var(ENV_CACHE_PATH, self.tmp.path().join("cache").display().to_string())
                .with_var(ENV_CHECK_NEW_VERSION, "0")
        }

        fn prepare_with(&self, env: EnvConfig) -> Result<PrepareResult> {
            let gctx = GlobalContext::with_env(self.tmp.path().to_path_buf(), env);
            let opts = PrepareOptions {
                target: Some("esp32".to_string()),
                idf_version: Some("5.1.0".to_string()),
                jobs: Some(2),
                ..Default::default()
            };
            prepare(&self.root(), &gctx, &opts)
        }

        fn prepare(&self) -> Result<PrepareResult> {
            self.prepare_with(self.env())
        }

        fn lock(&self) -> LockFile {
            LockFile::load(&self.root().join(LOCK_FILENAME))
                .unwrap()
                .unwrap()
        }

        fn managed(&self, dir: &str) -> PathBuf {
            self.root().join(MANAGED_COMPONENTS_DIR).join(dir)
        }
    }

    fn manifest(deps: &str) -> ProjectFixture {
        ProjectFixture::new(format!("dependencies:\n{}", deps))
    }

    fn publish_cmp(r: &FakeRegistry) {
        r.publish(
            ComponentBuilder::new("ex/cmp", "3.3.7")
                .file("src/cmp.c", "int cmp(void) { return 0; }"),
        );
    }

    #[test]
    fn test_diamond() {
        let p = Project::new(|r| {
            r.publish(ComponentBuilder::new("ex/a", "1.0.0").dependency("ex/c", ">=1,<3"));
            r.publish(ComponentBuilder::new("ex/b", "1.0.0").dependency("ex/c", ">=2,<4"));
            for v in ["1.0.0", "2.0.0", "3.0.0"] {
                r.publish(ComponentBuilder::new("ex/c", v));
            }
        });
        p.write(manifest("  ex/a: '*'\n  ex/b: '*'\n"));

        let result = p.prepare().unwrap();
        assert!(!result.lock_reused);
        assert!(result.lock_written);

        let lock = p.lock();
        assert_eq!(lock.dependencies["ex/c"].version, "2.0.0");
        assert_eq!(lock.direct_dependencies, vec!["ex/a", "ex/b", "idf"]);
        assert_eq!(lock.target, "esp32");
        assert!(p.managed("ex__c").join(".component_hash").is_file());
        assert!(p.managed("ex__c").join("CHECKSUMS.json").is_file());
        assert_eq!(result.component_paths["ex/a"], p.managed("ex__a"));
    }

    #[test]
    fn test_rollback() {
        let p = Project::new(|r| {
            r.publish(ComponentBuilder::new("ex/a", "1.0.0").dependency("ex/b", "1.0.0"));
            r.publish(ComponentBuilder::new("ex/a", "2.0.0").dependency("ex/b", "2.0.0"));
            r.publish(ComponentBuilder::new("ex/b", "1.0.0").dependency("ex/c", "2.0.0"));
            r.publish(ComponentBuilder::new("ex/b", "2.0.0").dependency("ex/c", ">=5"));
            r.publish(ComponentBuilder::new("ex/c", "2.0.0"));
        });
        p.write(manifest("  ex/a: '*'\n"));

        p.prepare().unwrap();
        assert_eq!(p.lock().dependencies["ex/a"].version, "1.0.0");
    }

    #[test]
    fn test_target_filter() {
        let p = Project::new(|r| {
            r.publish(ComponentBuilder::new("ex/x", "1.0.0").targets(&["esp32s2"]));
        });
        p.write(manifest("  ex/x: '*'\n"));

        let err = p.prepare().unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Unsatisfiable);
        assert!(format!("{:#}", err).contains("suitable versions for other targets"));
        assert!(!p.root().join(LOCK_FILENAME).exists());
    }

    #[test]
    fn test_project_target_must_be_supported() {
        let p = Project::new(|_| {});
        p.write(ProjectFixture::new("targets: [esp32s3]\ndependencies: {}\n"));

        let err = p.prepare().unwrap_err();
        assert_eq!(classify(&err), ErrorKind::UserInput);
    }

    #[test]
    fn test_local_override() {
        let p = Project::new(|r| {
            r.publish(ComponentBuilder::new("ex/lib", "2.0.0"));
        });
        p.write(
            manifest(&format!(
                "  ex/lib:\n    version: '*'\n    registry_url: {}\n    override_path: ../lib_src\n",
                p.registry.url()
            ))
            .with_file("lib_src/idf_component.yml", "version: 1.0.0\n")
            .with_file("lib_src/lib.c", "int lib;"),
        );

        let result = p.prepare().unwrap();
        let entry = &p.lock().dependencies["ex/lib"];
        assert_eq!(entry.version, "1.0.0");
        assert_eq!(
            entry.source,
            LockedSource::Local {
                path: "lib_src".to_string()
            }
        );
        assert!(entry.component_hash.is_none());
        assert_eq!(result.component_paths["ex/lib"], p.root().join("lib_src"));
        assert!(!p.managed("ex__lib").exists());
    }

    #[test]
    fn test_project_component_shadows_registry() {
        let p = Project::new(|r| {
            r.publish(ComponentBuilder::new("ex/led", "1.0.0"));
        });
        p.write(
            manifest("  ex/led: '*'\n")
                .with_component("led", ComponentBuilder::new("led", "0.1.0")),
        );

        p.prepare().unwrap();
        let lock = p.lock();
        let entry = &lock.dependencies["ex/led"];
        assert!(matches!(entry.source, LockedSource::Local { .. }));
        assert_eq!(p.registry.download_hits("ex/led", "1.0.0"), 0);
    }

    #[test]
    fn test_idempotent() {
        let p = Project::new(publish_cmp);
        p.write(manifest("  ex/cmp: '3.3.7'\n"));

        p.prepare().unwrap();
        let first = fs::read_to_string(p.root().join(LOCK_FILENAME)).unwrap();

        let second = p.prepare().unwrap();
        assert!(second.lock_reused);
        assert!(!second.lock_written);
        assert_eq!(fs::read_to_string(p.root().join(LOCK_FILENAME)).unwrap(), first);
        assert_eq!(p.registry.download_hits("ex/cmp", "3.3.7"), 1);
    }

    #[test]
    fn test_missing_managed_dir_is_restored_from_cache() {
        let p = Project::new(publish_cmp);
        p.write(manifest("  ex/cmp: '3.3.7'\n"));

        p.prepare().unwrap();
        fs::remove_dir_all(p.managed("ex__cmp")).unwrap();

        let result = p.prepare().unwrap();
        assert!(!result.lock_reused);
        assert!(p.managed("ex__cmp/src/cmp.c").is_file());
        assert_eq!(p.registry.download_hits("ex/cmp", "3.3.7"), 1);
    }

    #[test]
    fn test_strict_integrity_names_modified_file() {
        let p = Project::new(publish_cmp);
        p.write(manifest("  ex/cmp: '3.3.7'\n"));
        p.prepare().unwrap();

        fs::write(p.managed("ex__cmp/src/cmp.c"), "int cmp(void) { return 1; }").unwrap();

        let err = p
            .prepare_with(p.env().with_var(ENV_STRICT_CHECKSUM, "1"))
            .unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Integrity);
        assert!(format!("{:#}", err).contains("src/cmp.c"), "{:#}", err);
    }

    #[test]
    fn test_excluded_files_do_not_modify_component() {
        let p = Project::new(|r| {
            r.publish(
                ComponentBuilder::new("ex/cmp", "3.3.7")
                    .file("src/cmp.c", "int cmp(void) { return 0; }")
                    .exclude("**/*.log"),
            );
        });
        p.write(manifest("  ex/cmp: '3.3.7'\n"));
        p.prepare().unwrap();

        fs::write(p.managed("ex__cmp/trace.log"), "run 1").unwrap();
        fs::create_dir_all(p.managed("ex__cmp/build")).unwrap();
        fs::write(p.managed("ex__cmp/build/cmp.o"), "obj").unwrap();
        let filter = component_filter(&p.managed("ex__cmp")).unwrap();
        assert!(matches!(
            inspect(&p.managed("ex__cmp"), None).unwrap(),
            ManagedState::Valid
        ));
        assert!(!filter.files(&p.managed("ex__cmp")).unwrap().contains(&"trace.log".to_string()));

        let strict = p.env().with_var(ENV_STRICT_CHECKSUM, "1");
        p.prepare_with(strict.clone()).unwrap();
        assert!(p.managed("ex__cmp/trace.log").is_file());
        assert_eq!(p.registry.download_hits("ex/cmp", "3.3.7"), 1);

        fs::write(p.managed("ex__cmp/src/extra.c"), "int extra;").unwrap();
        let err = p.prepare_with(strict).unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Integrity);
        assert!(format!("{:#}", err).contains("src/extra.c"), "{:#}", err);
    }

    #[test]
    fn test_overwrite_replaces_modified_component() {
        let p = Project::new(publish_cmp);
        p.write(manifest("  ex/cmp: '3.3.7'\n"));
        p.prepare().unwrap();

        let file = p.managed("ex__cmp/src/cmp.c");
        fs::write(&file, "modified").unwrap();

        let env = p
            .env()
            .with_var(ENV_STRICT_CHECKSUM, "1")
            .with_var(ENV_OVERWRITE_MANAGED, "1");
        p.prepare_with(env).unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "int cmp(void) { return 0; }");
    }

    #[test]
    fn test_relaxed_mode_refetches_modified_component() {
        let p = Project::new(publish_cmp);
        p.write(manifest("  ex/cmp: '3.3.7'\n"));
        p.prepare().unwrap();

        let file = p.managed("ex__cmp/src/cmp.c");
        fs::write(&file, "modified").unwrap();

        p.prepare().unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "int cmp(void) { return 0; }");
    }

    #[test]
    fn test_relaxed_mode_keeps_unverified_component() {
        let p = Project::new(publish_cmp);
        p.write(manifest("  ex/cmp: '3.3.7'\n"));
        p.prepare().unwrap();

        let dir = p.managed("ex__cmp");
        fs::remove_file(dir.join(".component_hash")).unwrap();
        fs::remove_file(dir.join("CHECKSUMS.json")).unwrap();
        fs::write(dir.join("src/cmp.c"), "hand edited").unwrap();

        let result = p.prepare().unwrap();
        assert!(result.lock_reused);
        assert_eq!(fs::read_to_string(dir.join("src/cmp.c")).unwrap(), "hand edited");

        let err = p
            .prepare_with(p.env().with_var(ENV_STRICT_CHECKSUM, "1"))
            .unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Integrity);
    }

    #[test]
    fn test_empty_dependencies_lock_only_toolchain() {
        let p = Project::new(|_| {});
        p.write(ProjectFixture::new("dependencies: {}\n"));

        let result = p.prepare().unwrap();
        let lock = p.lock();
        assert_eq!(lock.dependencies.keys().collect::<Vec<_>>(), vec!["idf"]);
        assert_eq!(lock.dependencies["idf"].source, LockedSource::Idf {});
        assert_eq!(lock.dependencies["idf"].version, "5.1.0");
        assert!(!p.root().join(MANAGED_COMPONENTS_DIR).exists());
        assert!(result.component_paths.is_empty());
    }

    #[test]
    fn test_false_rule_is_omitted() {
        let p = Project::new(publish_cmp);
        p.write(manifest(
            "  ex/cmp:\n    version: '*'\n    rules:\n      - if: 'target == esp32s3'\n",
        ));

        p.prepare().unwrap();
        let lock = p.lock();
        assert!(!lock.dependencies.contains_key("ex/cmp"));
        assert_eq!(lock.direct_dependencies, vec!["idf"]);
    }

    #[test]
    fn test_equal_priority_sources_conflict() {
        let p = Project::new(|_| {});
        p.write(
            manifest("  lib:\n    path: ../lib\n  shared:\n    path: ../s1\n")
                .with_file(
                    "lib/idf_component.yml",
                    "version: 1.0.0\ndependencies:\n  shared:\n    path: ../s2\n",
                )
                .with_file("s1/idf_component.yml", "version: 1.0.0\n")
                .with_file("s2/idf_component.yml", "version: 2.0.0\n"),
        );

        let err = p.prepare().unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Unsatisfiable);
        assert!(format!("{:#}", err).contains("both added as"));
    }

    #[test]
    fn test_stale_component_is_removed() {
        let p = Project::new(publish_cmp);
        p.write(manifest("  ex/cmp: '3.3.7'\n"));
        p.prepare().unwrap();

        let hand_made = p.managed("mine");
        fs::create_dir_all(&hand_made).unwrap();

        p.write(ProjectFixture::new("dependencies: {}\n"));
        let result = p.prepare().unwrap();
        assert_eq!(result.removed, vec![p.managed("ex__cmp")]);
        assert!(!p.managed("ex__cmp").exists());
        assert!(hand_made.is_dir());
        assert!(!p.lock().dependencies.contains_key("ex/cmp"));
    }

    #[test]
    fn test_target_change_resolves_again() {
        let p = Project::new(publish_cmp);
        p.write(manifest("  ex/cmp: '*'\n"));
        p.prepare().unwrap();

        let gctx = GlobalContext::with_env(p.tmp.path().to_path_buf(), p.env());
        let opts = PrepareOptions {
            target: Some("esp32c3".to_string()),
            idf_version: Some("5.1.0".to_string()),
            ..Default::default()
        };
        let result = prepare(&p.root(), &gctx, &opts).unwrap();
        assert!(!result.lock_reused);
        assert_eq!(p.lock().target, "esp32c3");
        assert_eq!(p.lock().dependencies["ex/cmp"].version, "3.3.7");
    }

    #[test]
    fn test_locked_version_is_kept_after_manifest_change() {
        let p = Project::new(|r| {
            r.publish(ComponentBuilder::new("ex/a", "1.0.0"));
            r.publish(ComponentBuilder::new("ex/a", "1.1.0"));
            r.publish(ComponentBuilder::new("ex/b", "1.0.0"));
        });
        p.write(manifest("  ex/a: '<1.1'\n"));
        p.prepare().unwrap();

        // Widening the range keeps the locked 1.0.0
        p.write(manifest("  ex/a: '*'\n  ex/b: '*'\n"));
        p.prepare().unwrap();
        let lock = p.lock();
        assert_eq!(lock.dependencies["ex/a"].version, "1.0.0");
        assert_eq!(lock.dependencies["ex/b"].version, "1.0.0");
    }

    #[test]
    fn test_cancelled_before_solving() {
        let p = Project::new(publish_cmp);
        p.write(manifest("  ex/cmp: '*'\n"));

        let gctx = GlobalContext::with_env(p.tmp.path().to_path_buf(), p.env());
        let opts = PrepareOptions {
            idf_version: Some("5.1.0".to_string()),
            cancel: CancelToken::new(),
            ..Default::default()
        };
        opts.cancel.cancel();

        let err = prepare(&p.root(), &gctx, &opts).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnvironmentError>(),
            Some(EnvironmentError::Cancelled)
        ));
        assert_eq!(p.registry.download_hits("ex/cmp", "3.3.7"), 0);
    }

    #[test]
    fn test_git_commit_pin() {
        use crate::util::process::{find_executable, ProcessBuilder};

        if find_executable("git").is_none() {
            eprintln!("skipping: git not available");
            return;
        }
        let p = Project::new(|_| {});
        let upstream = p.tmp.path().join("upstream");
        fs::create_dir_all(upstream.join("lib/foo")).unwrap();
        fs::write(upstream.join("lib/foo/idf_component.yml"), "version: 1.0.0\n").unwrap();
        fs::write(upstream.join("lib/foo/foo.c"), "int foo;").unwrap();
        let git = |args: &[&str]| {
            let output = ProcessBuilder::new("git")
                .cwd(&upstream)
                .args(args)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@example.com")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@example.com")
                .exec_and_check()
                .unwrap();
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        };
        git(&["init", "--quiet"]);
        git(&["add", "."]);
        git(&["commit", "--quiet", "-m", "one"]);
        let commit = git(&["rev-parse", "HEAD"]);

        let url = upstream.display().to_string();
        p.write(manifest(&format!(
            "  foo:\n    git: '{}'\n    path: lib/foo\n    version: '{}'\n",
            url, commit
        )));

        let result = p.prepare().unwrap();
        let entry = &p.lock().dependencies["foo"];
        assert_eq!(entry.version, commit);
        assert!(matches!(&entry.source, LockedSource::Git { git, .. } if *git == url));
        assert!(entry.component_hash.is_some());
        assert!(result.component_paths["foo"].join("foo.c").is_file());
        assert_eq!(
            result.resolve.get("foo").unwrap().version,
            Version::Commit(commit.clone())
        );
    }
}
