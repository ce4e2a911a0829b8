//! Byte keys for the resource table and the owner index.
//!
//! Keys are NUL-delimited compositions of
//! `group, kind, partition, peer_name, namespace, name[, uid]`, so an ordered
//! scan over a prefix yields every resource of a type, a tenancy or a name
//! prefix. A wildcard tenancy field truncates the prefix at that field; the
//! store post-filters the wider scan against the full query.

use crate::resource::{UnversionedType, WILDCARD};
use crate::resourcepb::{Id, Tenancy};

const SEPARATOR: u8 = 0;

fn push_field(buf: &mut Vec<u8>, field: &str) {
    buf.extend_from_slice(field.as_bytes());
    buf.push(SEPARATOR);
}

fn push_id(buf: &mut Vec<u8>, id: &Id) {
    let (group, kind) = id
        .r#type
        .as_ref()
        .map(|ty| (ty.group.as_str(), ty.kind.as_str()))
        .unwrap_or_default();
    push_field(buf, group);
    push_field(buf, kind);

    let tenancy = id.tenancy.as_ref();
    push_field(buf, tenancy.map(|t| t.partition.as_str()).unwrap_or_default());
    push_field(buf, tenancy.map(|t| t.peer_name.as_str()).unwrap_or_default());
    push_field(buf, tenancy.map(|t| t.namespace.as_str()).unwrap_or_default());
    push_field(buf, &id.name);
}

/// Primary key of a resource. The uid is not part of it: a name holds at
/// most one incarnation at a time.
pub fn id_key(id: &Id) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    push_id(&mut buf, id);
    buf
}

/// Owner index key. References are recorded against one incarnation, so the
/// uid is included.
pub fn owner_key(id: &Id) -> Vec<u8> {
    let mut buf = id_key(id);
    push_field(&mut buf, &id.uid);
    buf
}

/// Scan prefix for a list or watch query.
///
/// Fields are appended until the first wildcard. With no wildcard the raw
/// name prefix is appended without a terminator so that it prefix-matches
/// stored names.
pub fn query_prefix(ty: &UnversionedType, tenancy: &Tenancy, name_prefix: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    push_field(&mut buf, &ty.group);
    push_field(&mut buf, &ty.kind);

    for field in [&tenancy.partition, &tenancy.peer_name, &tenancy.namespace] {
        if field == WILDCARD {
            return buf;
        }
        push_field(&mut buf, field);
    }

    buf.extend_from_slice(name_prefix.as_bytes());
    buf
}
