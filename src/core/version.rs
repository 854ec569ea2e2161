//! Component versions and version specs.
//!
//! A [`Version`] is a semantic version, a 40-hex commit id, or the wildcard
//! `*`. Only semantic versions have a meaningful order; [`Version::try_cmp`]
//! refuses to compare anything else. The derived `Ord` exists so versions can
//! live in solver ranges and sorted collections, and places every commit
//! below every semantic version.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use semver::Prerelease;
use thiserror::Error;

use crate::resolver::version::spec_to_ranges;
use crate::util::errors::ErrorKind;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid version `{value}`: {reason}")]
    InvalidVersion { value: String, reason: String },

    #[error("invalid version spec `{spec}`: {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("versions `{left}` and `{right}` cannot be compared")]
    IncomparableVersion { left: String, right: String },
}

impl VersionError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::UserInput
    }
}

/// Whether a string is a full 40-digit hex commit id.
pub fn is_commit_id(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// A concrete component version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Version {
    /// Wildcard version of an unversioned local component.
    Any,
    /// A git commit id, lowercase.
    Commit(String),
    Semver(semver::Version),
}

impl Version {
    /// Parse `*`, a commit id or a strict semantic version.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let s = s.trim();
        if s == "*" {
            return Ok(Version::Any);
        }
        if is_commit_id(s) {
            return Ok(Version::Commit(s.to_ascii_lowercase()));
        }
        semver::Version::parse(s)
            .map(Version::Semver)
            .map_err(|e| VersionError::InvalidVersion {
                value: s.to_string(),
                reason: e.to_string(),
            })
    }

    /// Parse a loosely formatted version such as `v5.1` or `5.2-dev`.
    ///
    /// Missing minor and patch numbers are filled with zeros and a leading
    /// `v` is dropped.
    pub fn parse_lenient(s: &str) -> Result<Self, VersionError> {
        let trimmed = s.trim();
        let stripped = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        if let Ok(v) = Version::parse(stripped) {
            return Ok(v);
        }

        let split = stripped.find(['-', '+']).unwrap_or(stripped.len());
        let (core, rest) = stripped.split_at(split);
        let mut parts: Vec<&str> = core.split('.').collect();
        if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(VersionError::InvalidVersion {
                value: s.to_string(),
                reason: "expected up to three numeric components".to_string(),
            });
        }
        while parts.len() < 3 {
            parts.push("0");
        }
        let padded = format!("{}{}", parts.join("."), rest);
        semver::Version::parse(&padded)
            .map(Version::Semver)
            .map_err(|e| VersionError::InvalidVersion {
                value: s.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn semver(&self) -> Option<&semver::Version> {
        match self {
            Version::Semver(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_prerelease(&self) -> bool {
        matches!(self, Version::Semver(v) if !v.pre.is_empty())
    }

    /// Semantic comparison. Only two semantic versions are comparable.
    pub fn try_cmp(&self, other: &Version) -> Result<Ordering, VersionError> {
        match (self, other) {
            (Version::Semver(a), Version::Semver(b)) => Ok(a.cmp(b)),
            _ => Err(VersionError::IncomparableVersion {
                left: self.to_string(),
                right: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Any => f.write_str("*"),
            Version::Commit(id) => f.write_str(id),
            Version::Semver(v) => write!(f, "{}", v),
        }
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl From<semver::Version> for Version {
    fn from(v: semver::Version) -> Self {
        Version::Semver(v)
    }
}

/// A version tagged with the hash of the content it was built from.
///
/// When both sides carry a hash, a mismatch makes otherwise equal versions
/// unequal.
#[derive(Debug, Clone, Eq)]
pub struct HashedVersion {
    pub version: Version,
    pub component_hash: Option<String>,
}

impl HashedVersion {
    pub fn new(version: Version, component_hash: Option<String>) -> Self {
        HashedVersion {
            version,
            component_hash,
        }
    }
}

impl PartialEq for HashedVersion {
    fn eq(&self, other: &Self) -> bool {
        if self.version != other.version {
            return false;
        }
        match (&self.component_hash, &other.component_hash) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Display for HashedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.version)
    }
}

/// Comparison operator of a single spec clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Exact,
    NotEqual,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    /// `~`: patch-level changes
    Tilde,
    /// `~=`: compatible release
    Compatible,
    /// `^`: changes that keep the left-most non-zero component
    Caret,
    /// `*`
    Any,
}

/// One clause of a range spec, e.g. `>=1.2` or `^0.3.1-beta`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Comparator {
    pub op: Op,
    pub major: u64,
    pub minor: Option<u64>,
    pub patch: Option<u64>,
    pub pre: Prerelease,
}

impl Comparator {
    fn any() -> Self {
        Comparator {
            op: Op::Any,
            major: 0,
            minor: None,
            patch: None,
            pre: Prerelease::EMPTY,
        }
    }

    /// The lowest version the clause's operand denotes.
    pub fn floor(&self) -> semver::Version {
        let mut v = semver::Version::new(
            self.major,
            self.minor.unwrap_or(0),
            self.patch.unwrap_or(0),
        );
        v.pre = self.pre.clone();
        v
    }

    pub fn is_partial(&self) -> bool {
        self.minor.is_none() || self.patch.is_none()
    }
}

/// A version constraint: a range expression or an exact commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionSpec {
    Range(RangeSpec),
    Commit(String),
}

/// Alternatives (`||`) of clause lists that must all hold (`,`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeSpec {
    raw: String,
    alternatives: Vec<Vec<Comparator>>,
}

impl RangeSpec {
    pub fn alternatives(&self) -> &[Vec<Comparator>] {
        &self.alternatives
    }
}

impl VersionSpec {
    /// The unconstrained spec `*`.
    pub fn any() -> Self {
        VersionSpec::Range(RangeSpec {
            raw: "*".to_string(),
            alternatives: vec![vec![Comparator::any()]],
        })
    }

    /// Exactly this version.
    pub fn exact(version: &Version) -> Self {
        match version {
            Version::Commit(id) => VersionSpec::Commit(id.clone()),
            Version::Any => VersionSpec::any(),
            Version::Semver(v) => VersionSpec::Range(RangeSpec {
                raw: format!("=={}", v),
                alternatives: vec![vec![Comparator {
                    op: Op::Exact,
                    major: v.major,
                    minor: Some(v.minor),
                    patch: Some(v.patch),
                    pre: v.pre.clone(),
                }]],
            }),
        }
    }

    /// Parse a spec. Empty input is `*`; a bare version means `==`.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let raw = s.trim();
        if raw.is_empty() || raw == "*" {
            return Ok(VersionSpec::any());
        }
        if is_commit_id(raw) {
            return Ok(VersionSpec::Commit(raw.to_ascii_lowercase()));
        }

        let invalid = |reason: String| VersionError::InvalidSpec {
            spec: raw.to_string(),
            reason,
        };

        let mut alternatives = Vec::new();
        for alternative in raw.split("||") {
            let clauses = tokenize(alternative);
            if clauses.is_empty() {
                return Err(invalid("empty alternative".to_string()));
            }
            let parsed = clauses
                .iter()
                .map(|c| parse_clause(c).map_err(&invalid))
                .collect::<Result<Vec<_>, _>>()?;
            alternatives.push(parsed);
        }

        Ok(VersionSpec::Range(RangeSpec {
            raw: raw.to_string(),
            alternatives,
        }))
    }

    /// Whether the spec places no constraint on semantic versions.
    pub fn is_any(&self) -> bool {
        match self {
            VersionSpec::Range(r) => r
                .alternatives
                .iter()
                .any(|alt| alt.iter().all(|c| c.op == Op::Any)),
            VersionSpec::Commit(_) => false,
        }
    }

    /// Whether any operand of the spec names a pre-release.
    pub fn contains_prerelease(&self) -> bool {
        match self {
            VersionSpec::Range(r) => r
                .alternatives
                .iter()
                .flatten()
                .any(|c| !c.pre.is_empty()),
            VersionSpec::Commit(_) => false,
        }
    }

    /// Match with the default pre-release policy.
    pub fn matches(&self, version: &Version) -> bool {
        self.matches_with(version, false)
    }

    /// Match, admitting pre-releases when the spec names one or when
    /// `allow_prerelease` is set.
    pub fn matches_with(&self, version: &Version, allow_prerelease: bool) -> bool {
        match (self, version) {
            (_, Version::Any) => true,
            (VersionSpec::Commit(id), Version::Commit(other)) => id == other,
            (VersionSpec::Commit(_), _) => false,
            (VersionSpec::Range(_), Version::Commit(_)) => self.is_any(),
            (VersionSpec::Range(_), Version::Semver(v)) => {
                if !v.pre.is_empty() && !(allow_prerelease || self.contains_prerelease()) {
                    return false;
                }
                spec_to_ranges(self).contains(version)
            }
        }
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Range(r) => f.write_str(&r.raw),
            VersionSpec::Commit(id) => f.write_str(id),
        }
    }
}

impl FromStr for VersionSpec {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionSpec::parse(s)
    }
}

impl Default for VersionSpec {
    fn default() -> Self {
        VersionSpec::any()
    }
}

const OPERATORS: &[(&str, Op)] = &[
    ("==", Op::Exact),
    ("!=", Op::NotEqual),
    ("<=", Op::LessEq),
    (">=", Op::GreaterEq),
    ("~=", Op::Compatible),
    ("=", Op::Exact),
    ("<", Op::Less),
    (">", Op::Greater),
    ("~", Op::Tilde),
    ("^", Op::Caret),
];

/// Split one alternative into clauses, gluing a lone operator to the
/// operand that follows it (`>= 1.0` becomes `>=1.0`).
fn tokenize(alternative: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut pending_op: Option<String> = None;

    for token in alternative
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
    {
        if OPERATORS.iter().any(|(op, _)| *op == token) {
            pending_op = Some(token.to_string());
            continue;
        }
        match pending_op.take() {
            Some(op) => clauses.push(format!("{}{}", op, token)),
            None => clauses.push(token.to_string()),
        }
    }
    if let Some(op) = pending_op {
        clauses.push(op);
    }
    clauses
}

fn parse_clause(clause: &str) -> Result<Comparator, String> {
    let (op, operand) = OPERATORS
        .iter()
        .find_map(|(sym, op)| clause.strip_prefix(sym).map(|rest| (*op, rest)))
        .unwrap_or((Op::Exact, clause));

    let operand = operand.trim();
    if operand.is_empty() {
        return Err(format!("operator `{}` has no version", clause));
    }

    let mut comparator = parse_partial(operand)?;
    comparator.op = match (op, comparator.op) {
        (_, Op::Any) if op == Op::Exact => Op::Any,
        (_, Op::Any) => return Err(format!("`{}` cannot be combined with `*`", clause)),
        _ => op,
    };
    if comparator.op == Op::Compatible && comparator.minor.is_none() {
        return Err("`~=` needs at least a major and minor version".to_string());
    }
    Ok(comparator)
}

/// Parse `1`, `1.2`, `1.2.x`, `1.2.3-rc.1` or `*`.
fn parse_partial(operand: &str) -> Result<Comparator, String> {
    let without_build = operand.split('+').next().unwrap_or(operand);
    let (core, pre) = match without_build.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (without_build, None),
    };

    let is_wild = |p: &str| matches!(p, "*" | "x" | "X");
    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() > 3 {
        return Err(format!("too many components in `{}`", operand));
    }
    if is_wild(parts[0]) {
        if parts.len() > 1 && !parts[1..].iter().all(|p| is_wild(p)) {
            return Err(format!("invalid wildcard in `{}`", operand));
        }
        return Ok(Comparator::any());
    }

    let number = |p: &str| -> Result<u64, String> {
        p.parse::<u64>()
            .map_err(|_| format!("`{}` is not a version number", p))
    };

    let major = number(parts[0])?;
    let mut minor = None;
    let mut patch = None;
    let mut wildcard_seen = false;
    for (idx, part) in parts.iter().enumerate().skip(1) {
        if is_wild(part) {
            wildcard_seen = true;
            continue;
        }
        if wildcard_seen {
            return Err(format!("invalid wildcard in `{}`", operand));
        }
        let n = number(part)?;
        if idx == 1 {
            minor = Some(n);
        } else {
            patch = Some(n);
        }
    }

    let pre = match pre {
        Some(p) => {
            if patch.is_none() {
                return Err(format!(
                    "pre-release `{}` needs a full major.minor.patch version",
                    p
                ));
            }
            Prerelease::new(p).map_err(|e| e.to_string())?
        }
        None => Prerelease::EMPTY,
    };

    Ok(Comparator {
        op: Op::Exact,
        major,
        minor,
        patch,
        pre,
    })
}
