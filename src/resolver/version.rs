//! Version spec handling for PubGrub.
//!
//! Specs become `Ranges<Version>`. Range specs are confined to the semantic
//! segment of the version order so that they never admit commits or `*`.

use pubgrub::Ranges;
use semver::Prerelease;

use crate::core::version::{Comparator, Op, Version, VersionSpec};

/// Smallest semantic version, `0.0.0-0`.
fn semver_floor() -> semver::Version {
    let mut v = semver::Version::new(0, 0, 0);
    v.pre = lowest_pre();
    v
}

fn lowest_pre() -> Prerelease {
    Prerelease::new("0").unwrap_or(Prerelease::EMPTY)
}

/// Every semantic version.
pub fn semver_segment() -> Ranges<Version> {
    Ranges::higher_than(Version::Semver(semver_floor()))
}

/// Convert a version spec to a PubGrub range.
pub fn spec_to_ranges(spec: &VersionSpec) -> Ranges<Version> {
    match spec {
        VersionSpec::Commit(id) => Ranges::singleton(Version::Commit(id.clone())),
        VersionSpec::Range(range) => {
            let mut union = Ranges::empty();
            for alternative in range.alternatives() {
                let mut all = semver_segment();
                for comp in alternative {
                    all = all.intersection(&comparator_to_range(comp));
                }
                union = union.union(&all);
            }
            union
        }
    }
}

/// `X.Y.Z-0`, the lowest version sharing the `X.Y.Z` release.
fn lower_bound(major: u64, minor: u64, patch: u64) -> Version {
    let mut v = semver::Version::new(major, minor, patch);
    v.pre = lowest_pre();
    Version::Semver(v)
}

/// `(major + 1).0.0-0`, or `None` when no such version exists.
fn next_major(major: u64) -> Option<Version> {
    major.checked_add(1).map(|m| lower_bound(m, 0, 0))
}

/// `major.(minor + 1).0-0`, carrying into the major on overflow.
fn next_minor(major: u64, minor: u64) -> Option<Version> {
    match minor.checked_add(1) {
        Some(mi) => Some(lower_bound(major, mi, 0)),
        None => next_major(major),
    }
}

/// `major.minor.(patch + 1)-0`, carrying into the minor on overflow.
fn next_patch(major: u64, minor: u64, patch: u64) -> Option<Version> {
    match patch.checked_add(1) {
        Some(p) => Some(lower_bound(major, minor, p)),
        None => next_minor(major, minor),
    }
}

/// The first version past everything the partial operand denotes, `None`
/// when the operand reaches the top of the version space.
fn next_after(comp: &Comparator) -> Option<Version> {
    match (comp.minor, comp.patch) {
        (None, _) => next_major(comp.major),
        (Some(minor), None) => next_minor(comp.major, minor),
        (Some(minor), Some(patch)) => next_patch(comp.major, minor, patch),
    }
}

/// `[lower, upper)`, unbounded above without an upper end.
fn bounded(lower: Version, upper: Option<Version>) -> Ranges<Version> {
    match upper {
        Some(upper) => Ranges::between(lower, upper),
        None => Ranges::higher_than(lower),
    }
}

/// Convert a single comparator to a PubGrub range.
fn comparator_to_range(comp: &Comparator) -> Ranges<Version> {
    let major = comp.major;
    let minor = comp.minor.unwrap_or(0);
    let version = Version::Semver(comp.floor());

    match comp.op {
        Op::Any => semver_segment(),

        Op::Exact => {
            if comp.is_partial() {
                bounded(version, next_after(comp))
            } else {
                Ranges::singleton(version)
            }
        }

        Op::NotEqual => {
            let exact = Comparator {
                op: Op::Exact,
                ..comp.clone()
            };
            comparator_to_range(&exact).complement()
        }

        Op::Less => {
            // <1.2.3 also excludes 1.2.3's pre-releases
            if comp.pre.is_empty() {
                Ranges::strictly_lower_than(lower_bound(major, minor, comp.patch.unwrap_or(0)))
            } else {
                Ranges::strictly_lower_than(version)
            }
        }

        Op::LessEq => {
            if comp.is_partial() {
                match next_after(comp) {
                    Some(upper) => Ranges::strictly_lower_than(upper),
                    None => semver_segment(),
                }
            } else {
                Ranges::lower_than(version)
            }
        }

        Op::Greater => {
            if comp.is_partial() {
                match next_after(comp) {
                    Some(upper) => Ranges::higher_than(upper),
                    None => Ranges::empty(),
                }
            } else {
                Ranges::strictly_higher_than(version)
            }
        }

        Op::GreaterEq => Ranges::higher_than(version),

        Op::Tilde => {
            // ~1.2.3 means >=1.2.3 <1.3.0, ~1 means >=1.0.0 <2.0.0
            let upper = if comp.minor.is_some() {
                next_minor(major, minor)
            } else {
                next_major(major)
            };
            bounded(version, upper)
        }

        Op::Compatible => {
            // ~=1.2.3 means >=1.2.3 <1.3.0, ~=1.2 means >=1.2 <2.0
            let upper = if comp.patch.is_some() {
                next_minor(major, minor)
            } else {
                next_major(major)
            };
            bounded(version, upper)
        }

        Op::Caret => {
            // ^1.2.3 means >=1.2.3 <2.0.0
            // ^0.2.3 means >=0.2.3 <0.3.0
            // ^0.0.3 means >=0.0.3 <0.0.4
            let upper = match (major, comp.minor, comp.patch) {
                (m, _, _) if m > 0 => next_major(m),
                (0, None, _) => next_major(0),
                (0, Some(mi), _) if mi > 0 => next_minor(0, mi),
                (0, Some(_), None) => next_minor(0, 0),
                (0, Some(_), Some(p)) => next_patch(0, 0, p),
                _ => next_major(major),
            };
            bounded(version, upper)
        }
    }
}
