//! Dependency specification.
//!
//! [`DependencySpec`] is the entry as written under `dependencies:` in a
//! manifest; [`Requirement`] is the resolved form the solver consumes, with
//! a canonical name, a concrete [`SourceRef`], a parsed spec and rules.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::context::BuildContext;
use crate::core::manifest::{ManifestError, MANIFEST_FILENAME};
use crate::core::name::{self, TOOLCHAIN_NAME};
use crate::core::rules::Rule;
use crate::core::source_id::{SourceRef, DEFAULT_REGISTRY_URL};
use crate::core::version::{is_commit_id, VersionSpec};
use crate::util::config::EnvConfig;

/// Dependency specification as it appears in `idf_component.yml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencySpec {
    /// Simple version spec: `foo: "^1.0"`
    Simple(String),

    /// Detailed specification
    Detailed(DetailedDependencySpec),
}

/// Detailed dependency specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetailedDependencySpec {
    /// Version spec, or the git ref for git dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Local directory, or the sub-directory inside a git repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_url: Option<String>,

    /// Deprecated spelling of `registry_url`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,

    /// Local directory that replaces whatever source is declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_path: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<RuleSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_release: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<bool>,

    /// Historic spelling of `public`: `public`, `private` or `no`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require: Option<String>,
}

/// One `- if: <expr>` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    #[serde(rename = "if")]
    pub condition: String,
}

/// What the solver needs to know about one dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct Requirement {
    /// Canonical lowercase name; registry names carry a namespace
    pub name: String,
    pub source: SourceRef,
    pub version_spec: VersionSpec,
    /// All must hold for the dependency to be active
    pub rules: Vec<Rule>,
    /// At least one must hold, when present
    pub matches: Vec<Rule>,
    /// Admit pre-release candidates
    pub pre_release: bool,
    pub public: bool,
}

impl Requirement {
    pub fn new(name: impl Into<String>, source: SourceRef, version_spec: VersionSpec) -> Self {
        Requirement {
            name: name.into(),
            source,
            version_spec,
            rules: Vec::new(),
            matches: Vec::new(),
            pre_release: false,
            public: false,
        }
    }

    /// Requirement on the toolchain itself.
    pub fn toolchain(version_spec: VersionSpec) -> Self {
        Requirement::new(TOOLCHAIN_NAME, SourceRef::Toolchain, version_spec)
    }

    /// Whether the rules admit this dependency under `ctx`.
    pub fn is_active(&self, ctx: &BuildContext) -> bool {
        self.rules.iter().all(|r| r.evaluate(ctx))
            && (self.matches.is_empty() || self.matches.iter().any(|r| r.evaluate(ctx)))
    }

    /// Whether pre-release candidates may be selected.
    pub fn allows_prerelease(&self) -> bool {
        self.pre_release || self.version_spec.contains_prerelease()
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) from {}", self.name, self.version_spec, self.source)
    }
}

impl DependencySpec {
    /// Resolve this entry into a [`Requirement`].
    ///
    /// Relative paths are resolved against `base_dir`, the directory of the
    /// manifest that declares the dependency.
    pub fn to_requirement(
        &self,
        raw_name: &str,
        base_dir: &Path,
        env: &EnvConfig,
    ) -> Result<Requirement, ManifestError> {
        let invalid = |reason: &str| ManifestError::InvalidDependency {
            name: raw_name.to_string(),
            reason: reason.to_string(),
        };

        if !name::is_valid(raw_name) {
            return Err(invalid("invalid component name"));
        }

        let detailed = match self {
            DependencySpec::Simple(spec) => DetailedDependencySpec {
                version: Some(spec.clone()),
                ..Default::default()
            },
            DependencySpec::Detailed(d) => d.clone(),
        };

        let parse_spec = |raw: Option<&str>| {
            VersionSpec::parse(raw.unwrap_or("*")).map_err(|e| ManifestError::InvalidDependency {
                name: raw_name.to_string(),
                reason: e.to_string(),
            })
        };

        let registry_url = match (&detailed.registry_url, &detailed.service_url) {
            (Some(registry), Some(service)) => {
                if registry != service {
                    tracing::warn!(
                        "dependency `{}` sets both registry_url and service_url; using registry_url",
                        raw_name
                    );
                }
                Some(registry.clone())
            }
            (Some(registry), None) => Some(registry.clone()),
            (None, Some(service)) => {
                tracing::warn!(
                    "`service_url` in dependency `{}` is deprecated; use `registry_url`",
                    raw_name
                );
                Some(service.clone())
            }
            (None, None) => None,
        };

        let selectors = [
            detailed.git.is_some(),
            detailed.path.is_some() && detailed.git.is_none(),
            registry_url.is_some(),
        ];
        if selectors.iter().filter(|s| **s).count() > 1 {
            return Err(invalid(
                "only one of `path`, `git` and `registry_url` may be given",
            ));
        }

        let mut requirement = if let Some(override_path) = &detailed.override_path {
            let dir = base_dir.join(override_path);
            if !dir.join(MANIFEST_FILENAME).is_file() {
                return Err(ManifestError::MissingOverrideManifest {
                    name: raw_name.to_string(),
                    path: dir,
                });
            }
            Requirement::new(
                name::normalize(raw_name),
                SourceRef::local(&dir),
                parse_spec(None)?,
            )
        } else if name::normalize(raw_name) == TOOLCHAIN_NAME {
            Requirement::toolchain(parse_spec(detailed.version.as_deref())?)
        } else if let Some(repo) = &detailed.git {
            let reference = detailed.version.as_deref();
            let spec = match reference {
                Some(r) if is_commit_id(r) => VersionSpec::Commit(r.to_ascii_lowercase()),
                _ => VersionSpec::any(),
            };
            Requirement::new(
                name::normalize(raw_name),
                SourceRef::git(repo, detailed.path.as_deref(), reference),
                spec,
            )
        } else if let Some(path) = &detailed.path {
            Requirement::new(
                name::normalize(raw_name),
                SourceRef::local(&base_dir.join(path)),
                parse_spec(None)?,
            )
        } else {
            let url = registry_url
                .as_deref()
                .or(env.registry_url())
                .unwrap_or(DEFAULT_REGISTRY_URL);
            let qualified = name::qualify(raw_name, env.namespace());
            let namespace = name::split(&qualified).0.map(str::to_string);
            Requirement::new(
                qualified,
                SourceRef::registry(url, namespace.as_deref()),
                parse_spec(detailed.version.as_deref())?,
            )
        };

        for spec in &detailed.rules {
            requirement.rules.push(Rule::parse(&spec.condition)?);
        }
        for spec in &detailed.matches {
            requirement.matches.push(Rule::parse(&spec.condition)?);
        }
        requirement.pre_release = detailed.pre_release.unwrap_or(false);
        requirement.public = match (detailed.public, detailed.require.as_deref()) {
            (Some(public), _) => public,
            (None, Some("public")) => true,
            (None, Some("private")) | (None, Some("no")) | (None, None) => false,
            (None, Some(other)) => {
                return Err(invalid(&format!(
                    "`require` must be `public`, `private` or `no`, not `{}`",
                    other
                )))
            }
        };

        Ok(requirement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(yaml: &str) -> DependencySpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn env() -> EnvConfig {
        EnvConfig::default()
    }

    #[test]
    fn test_simple_spec_is_registry() {
        let req = parse("\"^1.2\"")
            .to_requirement("LED_Strip", Path::new("/p"), &env())
            .unwrap();
        assert_eq!(req.name, "espressif/led_strip");
        assert_eq!(
            req.source,
            SourceRef::default_registry(Some("espressif"))
        );
        assert_eq!(req.version_spec.to_string(), "^1.2");
    }

    #[test]
    fn test_registry_url_from_env_and_namespace() {
        let env = EnvConfig::default()
            .with_var("IDF_COMPONENT_REGISTRY_URL", "http://localhost:5000/api")
            .with_var("IDF_COMPONENT_NAMESPACE", "acme");
        let req = parse("{version: '*'}")
            .to_requirement("cmp", Path::new("/p"), &env)
            .unwrap();
        assert_eq!(req.name, "acme/cmp");
        assert_eq!(req.source, SourceRef::registry("http://localhost:5000/", Some("acme")));
    }

    #[test]
    fn test_service_url_alias() {
        let req = parse("{service_url: 'https://example.com/api', version: '1.0.0'}")
            .to_requirement("ns/cmp", Path::new("/p"), &env())
            .unwrap();
        assert_eq!(req.source, SourceRef::registry("https://example.com/", Some("ns")));
    }

    #[test]
    fn test_toolchain_dependency() {
        let req = parse("'>=5.0'")
            .to_requirement("IDF", Path::new("/p"), &env())
            .unwrap();
        assert_eq!(req.source, SourceRef::Toolchain);
        assert_eq!(req.name, "idf");
    }

    #[test]
    fn test_git_dependency_with_commit() {
        let commit = "0123456789abcdef0123456789abcdef01234567";
        let yaml = format!("{{git: 'https://example.com/r.git', path: lib/foo, version: {}}}", commit);
        let req = parse(&yaml)
            .to_requirement("foo", Path::new("/p"), &env())
            .unwrap();
        assert_eq!(req.version_spec, VersionSpec::Commit(commit.to_string()));
        assert_eq!(
            req.source,
            SourceRef::git("https://example.com/r.git", Some("lib/foo"), Some(commit))
        );
    }

    #[test]
    fn test_git_dependency_with_branch() {
        let req = parse("{git: 'https://example.com/r.git', version: main}")
            .to_requirement("foo", Path::new("/p"), &env())
            .unwrap();
        assert!(req.version_spec.is_any());
    }

    #[test]
    fn test_override_path() {
        let tmp = TempDir::new().unwrap();
        let lib = tmp.path().join("lib_src");
        std::fs::create_dir_all(&lib).unwrap();
        std::fs::write(lib.join(MANIFEST_FILENAME), "version: 1.0.0\n").unwrap();
        let project = tmp.path().join("project");
        std::fs::create_dir_all(&project).unwrap();

        let req = parse("{registry_url: 'https://example.com', override_path: ../lib_src}")
            .to_requirement("lib", &project, &env())
            .unwrap();
        assert!(req.source.is_local());
        assert_eq!(req.name, "lib");
    }

    #[test]
    fn test_override_path_without_manifest() {
        let tmp = TempDir::new().unwrap();
        let err = parse("{override_path: missing}")
            .to_requirement("lib", tmp.path(), &env())
            .unwrap_err();
        assert!(matches!(err, ManifestError::MissingOverrideManifest { .. }));
    }

    #[test]
    fn test_conflicting_selectors() {
        let err = parse("{path: ../x, registry_url: 'https://example.com'}")
            .to_requirement("x", Path::new("/p"), &env())
            .unwrap_err();
        assert!(matches!(err, ManifestError::InvalidDependency { .. }));
    }

    #[test]
    fn test_escaping_names_rejected() {
        for raw in ["..", ".", "ex/..", "../x"] {
            let err = parse("\"*\"")
                .to_requirement(raw, Path::new("/p"), &env())
                .unwrap_err();
            assert!(matches!(err, ManifestError::InvalidDependency { .. }), "{}", raw);
        }
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<DependencySpec, _> = serde_yaml::from_str("{version: '1', colour: red}");
        assert!(result.is_err());
    }

    #[test]
    fn test_rules_and_require() {
        let req = parse(
            "{version: '*', rules: [{if: 'target == esp32'}], matches: [{if: 'idf_version >=5'}], require: public}",
        )
        .to_requirement("cmp", Path::new("/p"), &env())
        .unwrap();
        assert_eq!(req.rules.len(), 1);
        assert_eq!(req.matches.len(), 1);
        assert!(req.public);
        assert!(req.is_active(&BuildContext::new("esp32", None)));
        assert!(!req.is_active(&BuildContext::new("esp32c3", None)));
    }
}
