//! Test utilities shared by unit tests.
//!
//! The centerpiece is [`FakeRegistry`], an HTTP registry served by
//! `httpmock` that publishes [`ComponentBuilder`] versions.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = FakeRegistry::start();
//! registry.publish(ComponentBuilder::new("ex/cmp", "1.0.0"));
//! registry.serve();
//! let url = registry.url();
//! ```

pub mod fixtures;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use httpmock::prelude::*;
use httpmock::Mock;
use serde_json::{json, Value};

use crate::core::name::{self, TOOLCHAIN_NAME};

pub use fixtures::*;

struct Published {
    component: ComponentBuilder,
    hash: String,
    archive: Vec<u8>,
}

/// An in-process component registry.
pub struct FakeRegistry {
    server: &'static MockServer,
    components: RefCell<BTreeMap<String, Vec<Published>>>,
    downloads: RefCell<HashMap<(String, String), Mock<'static>>>,
}

impl FakeRegistry {
    pub fn start() -> Self {
        // Mocks borrow the server; tests are short lived.
        let server: &'static MockServer = Box::leak(Box::new(MockServer::start()));
        FakeRegistry {
            server,
            components: RefCell::new(BTreeMap::new()),
            downloads: RefCell::new(HashMap::new()),
        }
    }

    /// Registry URL, ending in `/`.
    pub fn url(&self) -> String {
        self.server.url("/")
    }

    /// Add a version. Returns its component hash.
    pub fn publish(&self, component: ComponentBuilder) -> String {
        let (archive, hash) = component.pack();
        self.components
            .borrow_mut()
            .entry(component.name.clone())
            .or_default()
            .push(Published {
                component,
                hash: hash.clone(),
                archive,
            });
        hash
    }

    /// Register HTTP endpoints for everything published so far.
    pub fn serve(&self) {
        for (full_name, versions) in self.components.borrow().iter() {
            let (ns, cmp) = name::split(full_name);
            let ns = ns.unwrap_or("espressif");
            let base = format!("/api/components/{}/{}", ns, cmp);

            let listing = json!({
                "name": cmp,
                "namespace": ns,
                "versions": versions.iter().map(version_json).collect::<Vec<_>>(),
            });
            self.server.mock(|when, then| {
                when.method(GET).path(base.clone());
                then.status(200).json_body(listing);
            });

            for published in versions {
                let version = &published.component.version;
                let file = format!("/files/{}_{}.tgz", name::build_name(full_name), version);
                let mut info = version_json(published);
                info["download_url"] = Value::String(file.clone());

                self.server.mock(|when, then| {
                    when.method(GET).path(format!("{}/versions/{}", base, version));
                    then.status(200).json_body(info);
                });
                let download = self.server.mock(|when, then| {
                    when.method(GET).path(file.clone());
                    then.status(200).body(published.archive.clone());
                });
                self.downloads
                    .borrow_mut()
                    .insert((full_name.clone(), version.clone()), download);
            }
        }
    }

    /// How many times the archive of `name` `version` was downloaded.
    pub fn download_hits(&self, full_name: &str, version: &str) -> usize {
        self.downloads
            .borrow()
            .get(&(full_name.to_string(), version.to_string()))
            .map(|m| m.hits())
            .unwrap_or(0)
    }
}

fn version_json(published: &Published) -> Value {
    let component = &published.component;
    let dependencies: Vec<Value> = component
        .dependencies
        .iter()
        .map(|(dep, spec)| {
            if name::normalize(dep) == TOOLCHAIN_NAME {
                json!({"name": TOOLCHAIN_NAME, "spec": spec, "source": "idf"})
            } else {
                let (ns, short) = name::split(dep);
                json!({"name": short, "namespace": ns, "spec": spec, "source": "service"})
            }
        })
        .collect();

    let mut info = json!({
        "version": component.version,
        "component_hash": published.hash,
        "targets": component.targets,
        "dependencies": dependencies,
    });
    if let Some(min) = &component.min_tool_version {
        info["min_component_manager_version"] = Value::String(min.clone());
    }
    info
}
