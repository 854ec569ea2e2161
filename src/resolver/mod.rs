//! Dependency resolution.
//!
//! This module implements PubGrub-based version resolution for components.
//! Candidate versions come from [`SourceMap`] sources; every name is bound
//! to exactly one source, picked by source priority.
//!
//! Binding happens while the solver expands dependencies. When a name turns
//! out to be required from a source that outranks its current binding, the
//! solve restarts with the stronger binding forced from the start. Bindings
//! only ever move up in priority, so this terminates.

pub mod errors;
pub mod resolve;
pub mod version;

pub use errors::ResolveError;
pub use resolve::{Resolve, ResolvedComponent, ResolvedDependency};

use std::cell::RefCell;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

use anyhow::{Context, Result};
use pubgrub::{
    DefaultStringReporter, Dependencies, DependencyProvider, PackageResolutionStatistics,
    PubGrubError, Ranges, Reporter,
};
use thiserror::Error;

use crate::core::context::BuildContext;
use crate::core::dependency::Requirement;
use crate::core::name;
use crate::core::source_id::SourceRef;
use crate::core::summary::ComponentWithVersions;
use crate::core::version::{HashedVersion, Version, VersionSpec};
use crate::sources::SourceMap;

use self::version::spec_to_ranges;

/// Upper bound on solver restarts caused by rebinding.
const MAX_ATTEMPTS: usize = 64;

/// A package for PubGrub resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Package {
    /// The project being resolved
    Root,
    Component(String),
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Package::Root => f.write_str("project"),
            Package::Component(name) => f.write_str(name),
        }
    }
}

/// The source a name is served from.
#[derive(Debug, Clone, PartialEq)]
struct Binding {
    source: SourceRef,
    /// Spec of the requirement that created the binding; selects the ref of
    /// git sources
    spec: VersionSpec,
}

/// Error type handed to PubGrub. The real error is kept by the provider.
#[derive(Debug, Error)]
#[error("dependency provider failed")]
pub struct ProviderError;

/// A stronger binding was found; the solve must start over.
#[derive(Debug, Error)]
#[error("component `{0}` needs to be rebound")]
struct Restart(String);

/// Solves a set of root requirements against the sources.
pub struct Resolver<'a> {
    sources: &'a SourceMap,
    ctx: &'a BuildContext,
    root: Vec<Requirement>,
    /// Project components by directory name
    project_components: BTreeMap<String, SourceRef>,
    locked: BTreeMap<String, ResolvedComponent>,
    listings: RefCell<HashMap<(String, SourceRef), Rc<ComponentWithVersions>>>,
}

impl<'a> Resolver<'a> {
    pub fn new(sources: &'a SourceMap, ctx: &'a BuildContext, root: Vec<Requirement>) -> Self {
        Resolver {
            sources,
            ctx,
            root,
            project_components: BTreeMap::new(),
            locked: BTreeMap::new(),
            listings: RefCell::new(HashMap::new()),
        }
    }

    /// Components that shadow any same-named requirement.
    pub fn with_project_components(mut self, components: BTreeMap<String, SourceRef>) -> Self {
        self.project_components = components;
        self
    }

    /// Prefer these versions where they still fit.
    pub fn with_locked(mut self, locked: &Resolve) -> Self {
        self.locked = locked
            .components()
            .map(|c| (c.name.clone(), c.clone()))
            .collect();
        self
    }

    /// Resolve the root requirements.
    pub fn resolve(&self) -> Result<Resolve> {
        let mut forced: BTreeMap<String, Binding> = BTreeMap::new();

        for attempt in 1..=MAX_ATTEMPTS {
            let provider = Provider::new(self, forced.clone());
            tracing::debug!("solving dependencies (attempt {})", attempt);

            match pubgrub::resolve(&provider, Package::Root, Version::Any) {
                Ok(solution) => {
                    let selected: BTreeMap<String, Version> = solution
                        .into_iter()
                        .filter_map(|(package, version)| match package {
                            Package::Component(name) => Some((name, version)),
                            Package::Root => None,
                        })
                        .collect();
                    return self.build(&provider, &selected);
                }
                Err(PubGrubError::NoSolution(mut tree)) => {
                    tree.collapse_no_versions();
                    return Err(ResolveError::Unsatisfiable {
                        report: DefaultStringReporter::report(&tree),
                        notes: provider.notes.into_inner().into_iter().collect(),
                    }
                    .into());
                }
                Err(other) => {
                    if let Some((name, binding)) = provider.rebind.take() {
                        tracing::debug!("restarting with {} bound to {}", name, binding.source);
                        forced.insert(name, binding);
                        continue;
                    }
                    if let Some(err) = provider.failure.take() {
                        return Err(err);
                    }
                    return Err(ResolveError::Internal {
                        message: other.to_string(),
                    }
                    .into());
                }
            }
        }

        Err(ResolveError::Internal {
            message: "source bindings did not settle".to_string(),
        }
        .into())
    }

    /// The project component shadowing `name`, matched on the full name or
    /// on the name without namespace.
    fn project_component(&self, full_name: &str) -> Option<&SourceRef> {
        self.project_components
            .get(full_name)
            .or_else(|| self.project_components.get(name::split(full_name).1))
    }

    fn cached_listing(&self, name: &str, binding: &Binding) -> Option<Rc<ComponentWithVersions>> {
        self.listings
            .borrow()
            .get(&(name.to_string(), binding.source.clone()))
            .cloned()
    }

    /// All versions `binding` offers for `name`, highest first.
    fn listing(&self, name: &str, binding: &Binding) -> Result<Rc<ComponentWithVersions>> {
        if let Some(listing) = self.cached_listing(name, binding) {
            return Ok(listing);
        }

        let source = self.sources.get_or_create(&binding.source)?;
        let spec = match binding.source {
            SourceRef::Git { .. } => binding.spec.clone(),
            _ => VersionSpec::any(),
        };
        let mut found = source
            .versions(name, &spec, Some(&self.ctx.target))
            .with_context(|| format!("failed to get versions of {} from {}", name, binding.source))?;
        found.versions.sort_by(|a, b| b.version().cmp(a.version()));

        let listing = Rc::new(found);
        self.listings
            .borrow_mut()
            .insert((name.to_string(), binding.source.clone()), Rc::clone(&listing));
        Ok(listing)
    }

    fn build(&self, provider: &Provider<'_, 'a>, selected: &BTreeMap<String, Version>) -> Result<Resolve> {
        let bindings = provider.bindings.borrow();
        let internal = |message: String| ResolveError::Internal { message };

        let mut resolve = Resolve::new();
        for (name, version) in selected {
            let binding = bindings
                .get(name)
                .ok_or_else(|| internal(format!("{} was selected without a source", name)))?;
            let listing = self
                .cached_listing(name, binding)
                .ok_or_else(|| internal(format!("{} was selected without a listing", name)))?;
            let candidate = listing
                .find(version)
                .ok_or_else(|| internal(format!("{} {} is not in its listing", name, version)))?;

            let dependencies = candidate
                .dependencies()
                .iter()
                .filter(|r| r.name != *name && r.is_active(self.ctx))
                .filter_map(|r| {
                    selected.get(&r.name).map(|v| ResolvedDependency {
                        name: r.name.clone(),
                        version: v.clone(),
                    })
                })
                .collect();

            let hash = if binding.source.download_required() {
                candidate.component_hash().map(str::to_string)
            } else {
                None
            };

            resolve.add_component(
                ResolvedComponent::new(name.clone(), version.clone(), binding.source.clone())
                    .with_hash(hash)
                    .with_dependencies(dependencies)
                    .with_targets(candidate.targets().to_vec()),
            );
        }

        let edges: Vec<(String, String)> = resolve
            .components()
            .flat_map(|c| c.dependencies.iter().map(move |d| (c.name.clone(), d.name.clone())))
            .collect();
        for (from, to) in edges {
            resolve.add_edge(&from, &to);
        }

        for requirement in self.root.iter().filter(|r| r.is_active(self.ctx)) {
            if selected.contains_key(&requirement.name) {
                resolve.add_direct(requirement.name.clone());
            }
        }

        tracing::info!("resolved {} component(s)", resolve.len());
        Ok(resolve)
    }
}

/// PubGrub's view of the sources for one solve attempt.
struct Provider<'r, 'a> {
    resolver: &'r Resolver<'a>,
    bindings: RefCell<BTreeMap<String, Binding>>,
    /// Pre-release candidates some requirement's range left out, for notes
    gated: RefCell<BTreeMap<String, BTreeSet<Version>>>,
    /// Explanations appended to an unsatisfiable report
    notes: RefCell<BTreeSet<String>>,
    rebind: RefCell<Option<(String, Binding)>>,
    failure: RefCell<Option<anyhow::Error>>,
}

impl<'r, 'a> Provider<'r, 'a> {
    fn new(resolver: &'r Resolver<'a>, forced: BTreeMap<String, Binding>) -> Self {
        Provider {
            resolver,
            bindings: RefCell::new(forced),
            gated: RefCell::new(BTreeMap::new()),
            notes: RefCell::new(BTreeSet::new()),
            rebind: RefCell::new(None),
            failure: RefCell::new(None),
        }
    }

    /// Keep `err` for the caller and hand PubGrub a marker.
    fn fail(&self, err: anyhow::Error) -> ProviderError {
        if !err.is::<Restart>() {
            *self.failure.borrow_mut() = Some(err);
        }
        ProviderError
    }

    fn binding(&self, name: &str) -> Result<Binding> {
        self.bindings.borrow().get(name).cloned().ok_or_else(|| {
            ResolveError::Internal {
                message: format!("{} has no source", name),
            }
            .into()
        })
    }

    /// Bind the requirement's name to a source, or confirm the binding.
    fn bind(&self, requirement: &Requirement) -> Result<Binding> {
        let wanted = match self.resolver.project_component(&requirement.name) {
            Some(source) => Binding {
                source: source.clone(),
                spec: VersionSpec::any(),
            },
            None => Binding {
                source: requirement.source.clone(),
                spec: requirement.version_spec.clone(),
            },
        };

        let mut bindings = self.bindings.borrow_mut();
        let Some(bound) = bindings.get(&requirement.name) else {
            tracing::debug!("{} comes from {}", requirement.name, wanted.source);
            bindings.insert(requirement.name.clone(), wanted.clone());
            return Ok(wanted);
        };

        if bound.source == wanted.source {
            return Ok(bound.clone());
        }
        match bound.source.priority().cmp(&wanted.source.priority()) {
            Ordering::Greater => Ok(bound.clone()),
            Ordering::Less => {
                *self.rebind.borrow_mut() = Some((requirement.name.clone(), wanted));
                Err(Restart(requirement.name.clone()).into())
            }
            Ordering::Equal => Err(ResolveError::SourceConflict {
                name: requirement.name.clone(),
                first: bound.source.to_string(),
                second: wanted.source.to_string(),
            }
            .into()),
        }
    }

    fn listing(&self, name: &str) -> Result<Rc<ComponentWithVersions>> {
        let binding = self.binding(name)?;
        self.resolver.listing(name, &binding)
    }

    fn note(&self, note: String) {
        self.notes.borrow_mut().insert(note);
    }

    /// Expand requirements into solver constraints.
    fn constraints(&self, parent: &Package, requirements: &[Requirement]) -> Result<Vec<(Package, Ranges<Version>)>> {
        let mut constraints: BTreeMap<Package, Ranges<Version>> = BTreeMap::new();

        for requirement in requirements {
            if let Package::Component(parent) = parent {
                if *parent == requirement.name {
                    continue;
                }
            }
            if !requirement.is_active(self.resolver.ctx) {
                tracing::debug!("{} is inactive for this build, skipping", requirement.name);
                continue;
            }

            let binding = self.bind(requirement)?;
            let listing = self.listing(&requirement.name)?;

            let mut range = requirement_range(requirement, &binding);
            if binding.source.is_registry() && !requirement.allows_prerelease() {
                range = self.without_prereleases(&requirement.name, range, &listing);
            }
            constraints
                .entry(Package::Component(requirement.name.clone()))
                .and_modify(|r| *r = r.intersection(&range))
                .or_insert(range);
        }

        Ok(constraints.into_iter().collect())
    }

    /// Cut the listed pre-releases out of a requirement's range.
    ///
    /// The gate is part of each requirement's constraint, so it goes away
    /// with the requirement when the solver backtracks.
    fn without_prereleases(
        &self,
        name: &str,
        mut range: Ranges<Version>,
        listing: &ComponentWithVersions,
    ) -> Ranges<Version> {
        for candidate in &listing.versions {
            let version = candidate.version();
            if version.is_prerelease() && range.contains(version) {
                range = range.intersection(&Ranges::singleton(version.clone()).complement());
                self.gated
                    .borrow_mut()
                    .entry(name.to_string())
                    .or_default()
                    .insert(version.clone());
            }
        }
        range
    }

    fn choose(&self, name: &str, range: &Ranges<Version>) -> Result<Option<Version>> {
        let binding = self.binding(name)?;
        let listing = self.resolver.listing(name, &binding)?;

        if let Some(locked) = self.resolver.locked.get(name) {
            if locked.source == binding.source && range.contains(&locked.version) {
                if let Some(candidate) = listing.find(&locked.version) {
                    let offered = HashedVersion::new(
                        candidate.version().clone(),
                        candidate.component_hash().map(str::to_string),
                    );
                    let pinned = HashedVersion::new(locked.version.clone(), locked.component_hash.clone());
                    if offered == pinned {
                        return Ok(Some(locked.version.clone()));
                    }
                    tracing::warn!(
                        "content of {} {} changed since it was locked",
                        name,
                        locked.version
                    );
                }
            }
        }

        if let Some(candidate) = listing.versions.iter().find(|c| range.contains(c.version())) {
            return Ok(Some(candidate.version().clone()));
        }

        let skipped: Vec<String> = self
            .gated
            .borrow()
            .get(name)
            .map(|versions| versions.iter().rev().map(Version::to_string).collect())
            .unwrap_or_default();
        if !skipped.is_empty() {
            self.note(format!(
                "{}: pre-release versions {} were skipped; set `pre_release: true` on the dependency to allow them",
                name,
                skipped.join(", ")
            ));
        }
        if listing.versions.is_empty() && !listing.other_targets.is_empty() {
            self.note(format!(
                "{}: no version supports target `{}`; found suitable versions for other targets: {}",
                name,
                self.resolver.ctx.target,
                listing.other_targets.join(", ")
            ));
        }
        for diagnostic in &listing.diagnostics {
            self.note(format!("{}: {}", name, diagnostic));
        }
        Ok(None)
    }
}

/// The versions a requirement admits once its name is bound.
///
/// Local components and unpinned git refs offer a single version and
/// constrain nothing.
fn requirement_range(requirement: &Requirement, binding: &Binding) -> Ranges<Version> {
    match &binding.source {
        SourceRef::Local { .. } => Ranges::full(),
        SourceRef::Git { .. } => match &binding.spec {
            VersionSpec::Commit(id) => Ranges::singleton(Version::Commit(id.clone())),
            VersionSpec::Range(_) => Ranges::full(),
        },
        SourceRef::Registry { .. } | SourceRef::Toolchain => spec_to_ranges(&requirement.version_spec),
    }
}

impl DependencyProvider for Provider<'_, '_> {
    type P = Package;
    type V = Version;
    type VS = Ranges<Version>;
    type M = String;
    type Err = ProviderError;
    /// Root first, then fewest matching candidates, then name.
    type Priority = (bool, Reverse<usize>, Reverse<String>);

    fn prioritize(
        &self,
        package: &Self::P,
        range: &Self::VS,
        _package_conflicts_counts: &PackageResolutionStatistics,
    ) -> Self::Priority {
        match package {
            Package::Root => (true, Reverse(0), Reverse(String::new())),
            Package::Component(name) => {
                let count = self
                    .bindings
                    .borrow()
                    .get(name)
                    .and_then(|b| self.resolver.cached_listing(name, b))
                    .map(|l| l.versions.iter().filter(|v| range.contains(v.version())).count())
                    .unwrap_or(0);
                (false, Reverse(count), Reverse(name.clone()))
            }
        }
    }

    fn choose_version(&self, package: &Self::P, range: &Self::VS) -> Result<Option<Self::V>, Self::Err> {
        match package {
            Package::Root => Ok(Some(Version::Any)),
            Package::Component(name) => self.choose(name, range).map_err(|e| self.fail(e)),
        }
    }

    fn get_dependencies(
        &self,
        package: &Self::P,
        version: &Self::V,
    ) -> Result<Dependencies<Self::P, Self::VS, Self::M>, Self::Err> {
        let requirements = match package {
            Package::Root => self.resolver.root.clone(),
            Package::Component(name) => {
                let listing = self.listing(name).map_err(|e| self.fail(e))?;
                match listing.find(version) {
                    Some(candidate) => candidate.dependencies().to_vec(),
                    None => {
                        return Ok(Dependencies::Unavailable(format!(
                            "{} {} is not offered by its source",
                            name, version
                        )))
                    }
                }
            }
        };

        let constraints = self
            .constraints(package, &requirements)
            .map_err(|e| self.fail(e))?;
        Ok(Dependencies::Available(constraints.into_iter().collect()))
    }
}
