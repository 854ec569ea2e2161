//! Resolve - the solved dependency graph.
//!
//! A Resolve is built once by the solver (or loaded from a lock file) and
//! is read-only afterwards.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::core::source_id::SourceRef;
use crate::core::version::Version;
use crate::resolver::errors::ResolveError;

/// One solved component.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedComponent {
    pub name: String,
    pub version: Version,
    pub source: SourceRef,
    /// Present iff the source is downloadable
    pub component_hash: Option<String>,
    /// Direct dependencies selected for this component, by name
    pub dependencies: Vec<ResolvedDependency>,
    /// Targets the selected version supports; empty means all
    pub targets: Vec<String>,
}

/// Edge of the resolved graph as recorded in the lock.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResolvedDependency {
    pub name: String,
    pub version: Version,
}

impl ResolvedComponent {
    pub fn new(name: impl Into<String>, version: Version, source: SourceRef) -> Self {
        ResolvedComponent {
            name: name.into(),
            version,
            source,
            component_hash: None,
            dependencies: Vec::new(),
            targets: Vec::new(),
        }
    }

    pub fn with_hash(mut self, hash: Option<String>) -> Self {
        self.component_hash = hash;
        self
    }

    pub fn with_dependencies(mut self, mut dependencies: Vec<ResolvedDependency>) -> Self {
        dependencies.sort();
        dependencies.dedup();
        self.dependencies = dependencies;
        self
    }

    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.targets = targets;
        self
    }

    /// Directory name under `managed_components/`: `ns__name`.
    pub fn build_name(&self) -> String {
        crate::core::name::build_name(&self.name)
    }
}

/// The resolved dependency graph.
///
/// Edges point from a component to its dependencies.
#[derive(Debug, Clone, Default)]
pub struct Resolve {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
    components: BTreeMap<String, ResolvedComponent>,
    /// Names the project depends on directly, sorted
    direct: Vec<String>,
}

impl Resolve {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from components whose edges are recorded in their
    /// `dependencies`.
    pub fn from_components(
        direct: impl IntoIterator<Item = String>,
        components: impl IntoIterator<Item = ResolvedComponent>,
    ) -> Self {
        let mut resolve = Resolve::new();
        for component in components {
            resolve.add_component(component);
        }
        let edges: Vec<(String, String)> = resolve
            .components
            .values()
            .flat_map(|c| {
                c.dependencies
                    .iter()
                    .map(move |d| (c.name.clone(), d.name.clone()))
            })
            .collect();
        for (from, to) in edges {
            resolve.add_edge(&from, &to);
        }
        for name in direct {
            resolve.add_direct(name);
        }
        resolve
    }

    pub fn add_component(&mut self, component: ResolvedComponent) {
        if !self.nodes.contains_key(&component.name) {
            let node = self.graph.add_node(component.name.clone());
            self.nodes.insert(component.name.clone(), node);
        }
        self.components.insert(component.name.clone(), component);
    }

    /// Record that `from` depends on `to`. Unknown names are ignored.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        if let (Some(&a), Some(&b)) = (self.nodes.get(from), self.nodes.get(to)) {
            if !self.graph.contains_edge(a, b) {
                self.graph.add_edge(a, b, ());
            }
        }
    }

    pub fn add_direct(&mut self, name: String) {
        if let Err(pos) = self.direct.binary_search(&name) {
            self.direct.insert(pos, name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedComponent> {
        self.components.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    /// Components in name order.
    pub fn components(&self) -> impl Iterator<Item = &ResolvedComponent> {
        self.components.values()
    }

    pub fn direct_dependencies(&self) -> &[String] {
        &self.direct
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Names of the components `name` depends on.
    pub fn deps(&self, name: &str) -> Vec<&str> {
        let Some(&node) = self.nodes.get(name) else {
            return Vec::new();
        };
        let mut deps: Vec<&str> = self
            .graph
            .neighbors(node)
            .map(|n| self.graph[n].as_str())
            .collect();
        deps.sort_unstable();
        deps
    }

    /// Components in dependency order: dependencies before dependents.
    pub fn topological_order(&self) -> Result<Vec<&ResolvedComponent>, ResolveError> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            let start = self.graph[cycle.node_id()].clone();
            ResolveError::CycleDetected {
                components: self.cycle_through(&start),
            }
        })?;

        // toposort puts a dependent before its dependencies
        Ok(order
            .into_iter()
            .rev()
            .filter_map(|n| self.components.get(&self.graph[n]))
            .collect())
    }

    /// A dependency path from `start` back to itself, for error messages.
    fn cycle_through(&self, start: &str) -> Vec<String> {
        let mut path = vec![start.to_string()];
        let mut seen = HashSet::new();
        let mut current = start.to_string();
        while seen.insert(current.clone()) {
            let next = self
                .deps(&current)
                .into_iter()
                .find(|d| self.transitive_deps(d).contains(start) || *d == start);
            match next {
                Some(next) => {
                    path.push(next.to_string());
                    if next == start {
                        break;
                    }
                    current = next.to_string();
                }
                None => break,
            }
        }
        path
    }

    /// Every component reachable from `name`, excluding `name` itself.
    pub fn transitive_deps(&self, name: &str) -> HashSet<String> {
        let mut visited = HashSet::new();
        let mut stack = vec![name.to_string()];

        while let Some(current) = stack.pop() {
            if visited.insert(current.clone()) {
                for dep in self.deps(&current) {
                    stack.push(dep.to_string());
                }
            }
        }

        visited.remove(name);
        visited
    }

    /// Names referenced as dependencies but missing from the graph.
    pub fn missing_dependencies(&self) -> Vec<(String, String)> {
        let mut missing = Vec::new();
        for name in &self.direct {
            if !self.components.contains_key(name) {
                missing.push(("<project>".to_string(), name.clone()));
            }
        }
        for component in self.components.values() {
            for dep in &component.dependencies {
                if !self.components.contains_key(&dep.name) {
                    missing.push((component.name.clone(), dep.name.clone()));
                }
            }
        }
        missing
    }
}
