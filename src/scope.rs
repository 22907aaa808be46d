//! Which endpoints an operator may see or act on.
//!
//! A [`Scope`] is derived per request and never stored. Every
//! endpoint-scoped query, single-row or listing, filters through the same
//! [`render_predicate`] output so the two can never disagree.

use std::collections::BTreeSet;

use crate::identity::{Principal, Role};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub is_admin: bool,
    /// `None` means unrestricted and only appears with `is_admin`.
    pub endpoint_ids: Option<BTreeSet<String>>,
}

impl Scope {
    pub fn unrestricted() -> Self {
        Self {
            is_admin: true,
            endpoint_ids: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            is_admin: false,
            endpoint_ids: Some(BTreeSet::new()),
        }
    }

    pub fn explicit(ids: BTreeSet<String>) -> Self {
        Self {
            is_admin: false,
            endpoint_ids: Some(ids),
        }
    }

    /// In-memory check mirroring the rendered predicate.
    pub fn permits(&self, endpoint_id: &str) -> bool {
        if self.is_admin {
            return true;
        }
        self.endpoint_ids
            .as_ref()
            .is_some_and(|ids| ids.contains(endpoint_id))
    }
}

/// A SQL boolean expression with `?N` placeholders and its bound values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub sql: String,
    pub params: Vec<String>,
}

const ALWAYS_TRUE: &str = "1 = 1";
const ALWAYS_FALSE: &str = "1 = 0";

fn is_safe_column(column: &str) -> bool {
    !column.is_empty()
        && column
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Render `scope` as a predicate on `column`, numbering placeholders from
/// `first_param`.
///
/// A column name that could carry anything but an identifier renders the
/// always-false predicate.
pub fn render_predicate(scope: &Scope, column: &str, first_param: usize) -> Predicate {
    let deny = || Predicate {
        sql: ALWAYS_FALSE.to_string(),
        params: Vec::new(),
    };
    if !is_safe_column(column) {
        tracing::warn!(column, "refusing to render scope predicate for unsafe column");
        return deny();
    }
    if scope.is_admin {
        return Predicate {
            sql: ALWAYS_TRUE.to_string(),
            params: Vec::new(),
        };
    }
    match &scope.endpoint_ids {
        Some(ids) if !ids.is_empty() => {
            let placeholders: Vec<String> = (0..ids.len())
                .map(|i| format!("?{}", first_param + i))
                .collect();
            Predicate {
                sql: format!("{column} IN ({})", placeholders.join(", ")),
                params: ids.iter().cloned().collect(),
            }
        }
        _ => deny(),
    }
}

/// Work out what `principal` may reach. No principal is the empty scope.
pub fn resolve(store: &Store, principal: Option<&Principal>) -> Result<Scope, StoreError> {
    let Some(principal) = principal else {
        return Ok(Scope::empty());
    };
    match principal.role {
        Role::Admin | Role::Superadmin => Ok(Scope::unrestricted()),
        Role::Technician => Ok(Scope::explicit(store.assigned_endpoint_ids(&principal.id)?)),
        Role::Unauthenticated => Ok(Scope::empty()),
    }
}

/// Single-row check through the shared predicate. An id the scope cannot
/// contain is refused without a query.
pub fn is_endpoint_in_scope(store: &Store, endpoint_id: &str, scope: &Scope) -> Result<bool, StoreError> {
    if !scope.permits(endpoint_id) {
        return Ok(false);
    }
    store.endpoint_in_scope(endpoint_id, scope)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn admin_renders_always_true() {
        let p = render_predicate(&Scope::unrestricted(), "e.id", 1);
        assert_eq!(p.sql, "1 = 1");
        assert!(p.params.is_empty());
    }

    #[test]
    fn empty_renders_always_false() {
        let p = render_predicate(&Scope::empty(), "id", 1);
        assert_eq!(p.sql, "1 = 0");
        assert!(p.params.is_empty());
    }

    #[test]
    fn explicit_set_renders_in_list() {
        let scope = Scope::explicit(ids(&["ep-b", "ep-a"]));
        let p = render_predicate(&scope, "endpoints.id", 3);
        assert_eq!(p.sql, "endpoints.id IN (?3, ?4)");
        assert_eq!(p.params, vec!["ep-a", "ep-b"]);
    }

    #[test]
    fn unsafe_column_denies_even_admin() {
        for column in ["", "id; DROP TABLE endpoints", "id OR 1=1", "`id`", "id--"] {
            let p = render_predicate(&Scope::unrestricted(), column, 1);
            assert_eq!(p.sql, "1 = 0", "{column:?}");
        }
    }

    #[test]
    fn non_admin_without_set_is_denied() {
        let odd = Scope {
            is_admin: false,
            endpoint_ids: None,
        };
        assert_eq!(render_predicate(&odd, "id", 1).sql, "1 = 0");
        assert!(!odd.permits("anything"));
    }

    #[test]
    fn permits_matches_predicate_semantics() {
        assert!(Scope::unrestricted().permits("x"));
        assert!(!Scope::empty().permits("x"));
        let scope = Scope::explicit(ids(&["a"]));
        assert!(scope.permits("a"));
        assert!(!scope.permits("b"));
    }

    #[test]
    fn single_endpoint_check_needs_scope_and_row() {
        let store = Store::open_in_memory().unwrap();
        let tenant = store.create_tenant("Acme").unwrap();
        let token = store
            .create_enrollment_token(&tenant.id, std::time::Duration::from_secs(60))
            .unwrap();
        let endpoint = store.enroll(&token, "machine-a", "host-a", "Test OS").unwrap().endpoint_id;

        assert!(is_endpoint_in_scope(&store, &endpoint, &Scope::unrestricted()).unwrap());
        assert!(!is_endpoint_in_scope(&store, "machine-z", &Scope::unrestricted()).unwrap());
        assert!(is_endpoint_in_scope(&store, &endpoint, &Scope::explicit(ids(&[endpoint.as_str()]))).unwrap());
        assert!(!is_endpoint_in_scope(&store, &endpoint, &Scope::explicit(ids(&["other"]))).unwrap());
        assert!(!is_endpoint_in_scope(&store, &endpoint, &Scope::empty()).unwrap());
    }

    #[test]
    fn resolve_by_role() {
        let store = Store::open_in_memory().unwrap();
        let mk = |role| Principal {
            id: "nobody".into(),
            display_name: "Nobody".into(),
            role,
        };
        assert_eq!(resolve(&store, None).unwrap(), Scope::empty());
        assert_eq!(resolve(&store, Some(&mk(Role::Admin))).unwrap(), Scope::unrestricted());
        assert_eq!(resolve(&store, Some(&mk(Role::Superadmin))).unwrap(), Scope::unrestricted());
        assert_eq!(resolve(&store, Some(&mk(Role::Unauthenticated))).unwrap(), Scope::empty());
        // A technician with no assignment rows sees nothing.
        assert_eq!(resolve(&store, Some(&mk(Role::Technician))).unwrap(), Scope::empty());
        assert!(resolve(&store, Some(&Principal::local_superadmin())).unwrap().is_admin);
    }
}
