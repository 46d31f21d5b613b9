//! Repository name and tag grammar (spec §3 "Repository"/"Tag", §4.J).
//!
//! This is the single source of truth for syntactic validity: both the
//! core (`blobstore`, `manifeststore`) and the HTTP adapter
//! (`utils::validation`) call through here rather than re-implementing the
//! regexes.

use regex::Regex;
use std::sync::LazyLock;

use crate::core::errors::CoreError;

const MAX_COMPONENTS: usize = 5;
const MIN_COMPONENT_LEN: usize = 2;
const MAX_COMPONENT_LEN: usize = 30;
const MAX_NAME_LEN: usize = 255;
const MAX_TAG_LEN: usize = 128;

static COMPONENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*$").unwrap());

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").unwrap());

/// `true`/`false` convenience used by request handlers that just need a
/// boolean gate; [`validate_name`] is the form that reports *why*.
pub fn is_valid_name(name: &str) -> bool {
    validate_name(name).is_ok()
}

pub fn is_valid_tag(tag: &str) -> bool {
    validate_tag(tag).is_ok()
}

/// Validates a repository name against spec §3's grammar: 1 to 5
/// slash-delimited components, each matching
/// `[a-z0-9]+(?:[._-][a-z0-9]+)*`, each component length in `[2, 30]`,
/// total length at most 255.
pub fn validate_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(CoreError::NameInvalid(name.to_string()));
    }
    let components: Vec<&str> = name.split('/').collect();
    if components.is_empty() || components.len() > MAX_COMPONENTS {
        return Err(CoreError::NameInvalid(name.to_string()));
    }
    for component in &components {
        if component.len() < MIN_COMPONENT_LEN || component.len() > MAX_COMPONENT_LEN {
            return Err(CoreError::NameInvalid(name.to_string()));
        }
        if !COMPONENT_RE.is_match(component) {
            return Err(CoreError::NameInvalid(name.to_string()));
        }
    }
    Ok(())
}

/// Validates a tag against spec §3's grammar:
/// `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
pub fn validate_tag(tag: &str) -> Result<(), CoreError> {
    if tag.is_empty() || tag.len() > MAX_TAG_LEN || !TAG_RE.is_match(tag) {
        return Err(CoreError::TagInvalid(tag.to_string()));
    }
    Ok(())
}

/// A `reference` in the OCI API is either a tag or a digest; this decides
/// which grammar applies without attempting to parse the digest.
pub fn looks_like_digest(reference: &str) -> bool {
    reference.contains(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_names() {
        assert!(is_valid_name("library/alpine"));
        assert!(is_valid_name("admin/a-repo"));
        assert!(is_valid_name("a1/b2/c3"));
    }

    #[test]
    fn rejects_too_many_components() {
        assert!(!is_valid_name("a/b/c/d/e/f"));
    }

    #[test]
    fn rejects_short_components() {
        assert!(!is_valid_name("a/bc"));
    }

    #[test]
    fn rejects_uppercase() {
        assert!(!is_valid_name("Library/Alpine"));
    }

    #[test]
    fn round_trip_name_grammar() {
        for good in ["library/alpine", "foo-bar/baz.qux", "a1/b2/c3/d4/e5"] {
            assert!(validate_name(good).is_ok());
        }
        for bad in ["", "UPPER/case", "a//b", "a/bcdefghijklmnopqrstuvwxyz0123456789x"] {
            assert!(validate_name(bad).is_err());
        }
    }

    #[test]
    fn tag_grammar() {
        assert!(is_valid_tag("latest"));
        assert!(is_valid_tag("1.0.0-rc.1"));
        assert!(!is_valid_tag(".starts-with-dot"));
        assert!(!is_valid_tag(""));
    }
}
