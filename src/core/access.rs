//! Access Controller Contract (spec §4.H).
//!
//! The core never verifies a bearer token itself — that is the HTTP
//! adapter's job (spec §1 OUT OF SCOPE). What the core consumes is an
//! already-verified [`AccessSet`]: a mapping from `(resource-type,
//! resource-name)` to the set of actions the caller is entitled to. The
//! adapter calls [`authorize`] once per request, before any mutation.

use std::collections::{HashMap, HashSet};

use crate::core::errors::CoreError;

/// The action that grants every other action for a resource, per spec
/// §4.H ("The special action `*` grants all").
pub const WILDCARD_ACTION: &str = "*";

/// A verified mapping from `(type, name)` to the actions a caller may
/// perform on that resource. Built by the adapter from a bearer token (or,
/// in this repository's reference adapter, from the JWT `sub` claim plus
/// the repository catalog's visibility flag); opaque to the core beyond
/// this shape.
#[derive(Debug, Clone, Default)]
pub struct AccessSet {
    grants: HashMap<(String, String), HashSet<String>>,
}

impl AccessSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `action` on `(resource_type, name)`. Repeated grants of the
    /// same action are idempotent.
    pub fn grant(&mut self, resource_type: impl Into<String>, name: impl Into<String>, action: impl Into<String>) {
        self.grants
            .entry((resource_type.into(), name.into()))
            .or_default()
            .insert(action.into());
    }

    /// An [`AccessSet`] granting every action on every resource; used by
    /// the reference adapter's debug routes and by the migration CLI,
    /// which runs outside any request's authorization boundary.
    pub fn unrestricted() -> Self {
        let mut set = Self::new();
        set.grant("repository", "*", WILDCARD_ACTION);
        set
    }

    pub fn allows(&self, resource_type: &str, name: &str, action: &str) -> bool {
        let exact = self
            .grants
            .get(&(resource_type.to_string(), name.to_string()))
            .is_some_and(|actions| actions.contains(WILDCARD_ACTION) || actions.contains(action));
        if exact {
            return true;
        }
        // `unrestricted()` grants on the literal name "*"; check that too
        // so a single wildcard resource entry covers every name.
        self.grants
            .get(&(resource_type.to_string(), "*".to_string()))
            .is_some_and(|actions| actions.contains(WILDCARD_ACTION) || actions.contains(action))
    }
}

/// Spec §4.H: `authorize(access-set, required-resource, required-action) →
/// ok | denied`. The core calls this once per request before any mutation.
pub fn authorize(
    access: &AccessSet,
    resource_type: &str,
    name: &str,
    action: &str,
) -> Result<(), CoreError> {
    if access.allows(resource_type, name, action) {
        Ok(())
    } else {
        Err(CoreError::Unauthorized(format!(
            "missing `{action}` on {resource_type} `{name}`"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_grant_allows_matching_action() {
        let mut set = AccessSet::new();
        set.grant("repository", "library/alpine", "pull");
        assert!(authorize(&set, "repository", "library/alpine", "pull").is_ok());
        assert!(authorize(&set, "repository", "library/alpine", "push").is_err());
    }

    #[test]
    fn wildcard_action_grants_everything_on_that_resource() {
        let mut set = AccessSet::new();
        set.grant("repository", "admin/a-repo", WILDCARD_ACTION);
        assert!(authorize(&set, "repository", "admin/a-repo", "delete").is_ok());
    }

    #[test]
    fn unrelated_resource_is_denied() {
        let mut set = AccessSet::new();
        set.grant("repository", "library/alpine", "pull");
        assert!(authorize(&set, "repository", "library/busybox", "pull").is_err());
    }

    #[test]
    fn unrestricted_allows_any_repository_and_action() {
        let set = AccessSet::unrestricted();
        assert!(authorize(&set, "repository", "anything/at-all", "push").is_ok());
    }
}
