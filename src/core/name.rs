//! Component names.
//!
//! Names are case-insensitive and stored lowercase. Registry components are
//! namespaced (`espressif/led_strip`); a name without a namespace is
//! qualified with the default one when it refers to the registry.

/// Name of the toolchain pseudo-component.
pub const TOOLCHAIN_NAME: &str = "idf";

/// Lowercase and trim a component name.
pub fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Qualify a registry name with `namespace` unless it already has one.
pub fn qualify(name: &str, namespace: &str) -> String {
    let name = normalize(name);
    if name.contains('/') {
        name
    } else {
        format!("{}/{}", normalize(namespace), name)
    }
}

/// Split `ns/name` into its parts.
pub fn split(name: &str) -> (Option<&str>, &str) {
    match name.split_once('/') {
        Some((ns, short)) => (Some(ns), short),
        None => (None, name),
    }
}

/// Directory name used under `managed_components/` and in the cache:
/// `ns/name` becomes `ns__name`.
pub fn build_name(name: &str) -> String {
    normalize(name).replace('/', "__")
}

/// Check a name for characters that cannot appear in a directory name.
///
/// At most one `/`; no segment may be empty or start with `.`.
pub fn is_valid(name: &str) -> bool {
    let name = name.trim();
    let segments: Vec<&str> = name.split('/').collect();
    segments.len() <= 2
        && segments.iter().all(|segment| {
            !segment.is_empty()
                && !segment.starts_with('.')
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualify() {
        assert_eq!(qualify("LED_Strip", "espressif"), "espressif/led_strip");
        assert_eq!(qualify("ex/cmp", "espressif"), "ex/cmp");
    }

    #[test]
    fn test_build_name() {
        assert_eq!(build_name("ex/cmp"), "ex__cmp");
        assert_eq!(build_name("local_lib"), "local_lib");
    }

    #[test]
    fn test_is_valid() {
        assert!(is_valid("espressif/cjson"));
        assert!(!is_valid("a/b/c"));
        assert!(!is_valid("bad name"));
        assert!(!is_valid(""));
        assert!(is_valid("ex/lib.v2"));
        assert!(!is_valid("/cjson"));
        assert!(!is_valid("espressif/"));
        assert!(!is_valid("."));
        assert!(!is_valid(".."));
        assert!(!is_valid("../cjson"));
        assert!(!is_valid("ex/.."));
        assert!(!is_valid(".hidden"));
    }
}
