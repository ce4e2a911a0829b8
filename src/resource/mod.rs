//! Resource identity helpers shared by the store, the watch layer and the
//! resource service.
//!
//! Resources are identified by:
//! - a `Type` (group, group version, kind)
//! - a `Tenancy` (partition, peer name, namespace)
//! - a user-chosen name and a system-assigned uid
//!
//! Storage only ever looks at the unversioned part of a type; GroupVersion is
//! checked on reads and filtered by the resource service on lists.

pub mod registry;

pub use registry::{MutateHook, Registration, Registry, RegistryError, Scope, ValidateHook};

use std::collections::HashMap;
use std::fmt;

use crate::resourcepb::{Id, Status, Tenancy, Type};

/// Tenancy field value that matches every value in List and Watch queries.
pub const WILDCARD: &str = "*";

/// Group and kind of a type, without the schema version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnversionedType {
    pub group: String,
    pub kind: String,
}

impl UnversionedType {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }

    /// Whether `ty` belongs to this lineage regardless of its GroupVersion.
    pub fn matches(&self, ty: &Type) -> bool {
        self.group == ty.group && self.kind == ty.kind
    }
}

impl From<&Type> for UnversionedType {
    fn from(ty: &Type) -> Self {
        Self::new(ty.group.clone(), ty.kind.clone())
    }
}

impl fmt::Display for UnversionedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.kind)
    }
}

/// Formats a type as `group.version.Kind`.
pub fn type_string(ty: &Type) -> String {
    format!("{}.{}.{}", ty.group, ty.group_version, ty.kind)
}

/// Formats an id for log lines.
pub fn id_string(id: &Id) -> String {
    let ty = id.r#type.as_ref().map(type_string).unwrap_or_default();
    let tenancy = id
        .tenancy
        .as_ref()
        .map(tenancy_string)
        .unwrap_or_default();
    format!("{}/{}/{}", ty, tenancy, id.name)
}

/// Formats a tenancy as `partition.peer_name.namespace`.
pub fn tenancy_string(tenancy: &Tenancy) -> String {
    format!(
        "{}.{}.{}",
        tenancy.partition, tenancy.peer_name, tenancy.namespace
    )
}

/// Returns the id's type, or the empty type when unset.
pub fn id_type(id: &Id) -> Type {
    id.r#type.clone().unwrap_or_default()
}

/// Returns the id's tenancy, or the empty tenancy when unset.
pub fn id_tenancy(id: &Id) -> Tenancy {
    id.tenancy.clone().unwrap_or_default()
}

pub fn equal_type(a: &Type, b: &Type) -> bool {
    a.group == b.group && a.group_version == b.group_version && a.kind == b.kind
}

/// Compares two optional ids field by field, including the uid.
pub fn equal_id(a: Option<&Id>, b: Option<&Id>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

pub fn equal_status_map(a: &HashMap<String, Status>, b: &HashMap<String, Status>) -> bool {
    a == b
}

/// Whether any tenancy field carries the wildcard sentinel.
pub fn is_wildcard_tenancy(tenancy: &Tenancy) -> bool {
    tenancy.partition == WILDCARD
        || tenancy.peer_name == WILDCARD
        || tenancy.namespace == WILDCARD
}

/// Matches a concrete tenancy against a query tenancy whose fields may be
/// wildcards.
pub fn tenancy_matches(query: &Tenancy, tenancy: &Tenancy) -> bool {
    field_matches(&query.partition, &tenancy.partition)
        && field_matches(&query.peer_name, &tenancy.peer_name)
        && field_matches(&query.namespace, &tenancy.namespace)
}

fn field_matches(query: &str, value: &str) -> bool {
    query == WILDCARD || query == value
}

/// Generates a new uid for a freshly created resource.
pub fn new_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generates a new, time-ordered generation token.
pub fn new_generation() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Whether `value` was produced by `new_generation`.
pub fn is_valid_generation(value: &str) -> bool {
    uuid::Uuid::parse_str(value).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenancy(partition: &str, peer_name: &str, namespace: &str) -> Tenancy {
        Tenancy {
            partition: partition.to_string(),
            peer_name: peer_name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    #[test]
    fn test_tenancy_matches_wildcards() {
        let stored = tenancy("default", "local", "default");

        assert!(tenancy_matches(&tenancy("*", "*", "*"), &stored));
        assert!(tenancy_matches(&tenancy("default", "*", "default"), &stored));
        assert!(!tenancy_matches(&tenancy("billing", "*", "*"), &stored));
        assert!(!tenancy_matches(&tenancy("default", "local", "other"), &stored));
    }

    #[test]
    fn test_is_wildcard_tenancy() {
        assert!(is_wildcard_tenancy(&tenancy("default", "*", "default")));
        assert!(!is_wildcard_tenancy(&tenancy("default", "local", "default")));
    }

    #[test]
    fn test_unversioned_type_matches() {
        let ty = Type {
            group: "demo".to_string(),
            group_version: "v2".to_string(),
            kind: "Artist".to_string(),
        };
        let unversioned = UnversionedType::from(&ty);

        assert_eq!(unversioned.to_string(), "demo.Artist");
        assert_eq!(type_string(&ty), "demo.v2.Artist");
        assert!(unversioned.matches(&Type {
            group_version: "v1".to_string(),
            ..ty.clone()
        }));
    }

    #[test]
    fn test_generation_tokens() {
        let a = new_generation();
        let b = new_generation();
        assert_ne!(a, b);
        assert!(is_valid_generation(&a));
        assert!(!is_valid_generation("bogus"));
    }
}
