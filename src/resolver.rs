// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deterministic conflict resolution.
//!
//! Used when the same entity was changed on both replicas since they last
//! agreed. [`ConflictResolver::resolve`] is a pure function of its inputs and
//! is commutative in `(local, remote)`, so both replicas compute the same
//! merged snapshot independently.
//!
//! # Policy
//!
//! - **Later side**: ordered by `local_timestamp`, then by whether the side
//!   was written by the authority replica, then by content hash. The greater
//!   one is "later".
//! - **Scalar fields**: the later side's values.
//! - **Structural fields** (see [`crate::model::structural_fields`]): three-way
//!   merge against the common ancestor. Additions from either side are kept;
//!   anything the ancestor had survives only if the later side still has it.
//!   Nested objects merge key-wise with the same rule.
//! - **Tombstone**: the later side's `deleted`.
//! - **Fast path**: a side still at the ancestor version did not change, so
//!   the other side's content is taken as-is.

use serde_json::{Map, Value};
use std::cmp::Ordering;

use crate::entity::EntitySnapshot;
use crate::model::structural_fields;

/// The last version both sides are known to share.
#[derive(Debug, Clone, PartialEq)]
pub struct CommonAncestor {
    pub version: u64,
    /// The ancestor's content, if still retained. Without it structural
    /// fields fall back to a plain union.
    pub snapshot: Option<EntitySnapshot>,
}

impl CommonAncestor {
    #[must_use]
    pub fn new(version: u64, snapshot: Option<EntitySnapshot>) -> Self {
        Self { version, snapshot }
    }

    /// Ancestor known only by version number.
    #[must_use]
    pub fn version_only(version: u64) -> Self {
        Self { version, snapshot: None }
    }
}

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    authority: String,
}

impl ConflictResolver {
    /// `authority` is the replica whose writes win timestamp ties (the server).
    pub fn new(authority: impl Into<String>) -> Self {
        Self { authority: authority.into() }
    }

    #[must_use]
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Total order used to pick the later side.
    fn precedence(&self, a: &EntitySnapshot, b: &EntitySnapshot) -> Ordering {
        a.local_timestamp
            .cmp(&b.local_timestamp)
            .then_with(|| (a.modified_by == self.authority).cmp(&(b.modified_by == self.authority)))
            .then_with(|| a.content_hash().cmp(&b.content_hash()))
    }

    #[must_use]
    pub fn resolve(&self, local: &EntitySnapshot, remote: &EntitySnapshot, ancestor: &CommonAncestor) -> EntitySnapshot {
        let (later, earlier) = match self.precedence(local, remote) {
            Ordering::Less => (remote, local),
            _ => (local, remote),
        };

        let local_changed = local.version != ancestor.version;
        let remote_changed = remote.version != ancestor.version;

        let mut merged = match (local_changed, remote_changed) {
            (false, true) => remote.clone(),
            (true, false) => local.clone(),
            _ => self.merge_content(later, earlier, ancestor),
        };

        let (first_created, first_origin) = std::cmp::min(
            (local.created_at, &local.origin),
            (remote.created_at, &remote.origin),
        );

        merged.version = local.version.max(remote.version) + 1;
        merged.base_version = local.version.max(remote.version);
        merged.local_timestamp = local.local_timestamp.max(remote.local_timestamp);
        merged.created_at = first_created;
        merged.origin = first_origin.clone();
        merged.modified_by = self.authority.clone();
        merged
    }

    fn merge_content(&self, later: &EntitySnapshot, earlier: &EntitySnapshot, ancestor: &CommonAncestor) -> EntitySnapshot {
        let mut merged = later.clone();
        let ancestor_fields = ancestor.snapshot.as_ref().map(|s| &s.fields);

        if let Value::Object(out) = &mut merged.fields {
            for field in structural_fields(later.kind) {
                let value = merge_value(
                    ancestor_fields.and_then(|f| present(f.get(*field))),
                    present(later.fields.get(*field)),
                    present(earlier.fields.get(*field)),
                );
                match value {
                    Some(v) => out.insert((*field).to_string(), v),
                    None => out.remove(*field),
                };
            }
        }

        merged
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

/// Three-way merge of one structural value, biased to `later`.
fn merge_value(ancestor: Option<&Value>, later: Option<&Value>, earlier: Option<&Value>) -> Option<Value> {
    match (later, earlier) {
        (Some(Value::Array(l)), Some(Value::Array(e))) => {
            let base: &[Value] = match ancestor {
                Some(Value::Array(a)) => a.as_slice(),
                _ => &[],
            };
            Some(Value::Array(merge_arrays(base, l, e)))
        }
        (Some(Value::Object(l)), Some(Value::Object(e))) => {
            let empty = Map::new();
            let base = match ancestor {
                Some(Value::Object(a)) => a,
                _ => &empty,
            };
            Some(Value::Object(merge_objects(base, l, e)))
        }
        (Some(l), _) => Some(l.clone()),
        // later dropped it: keep only if earlier introduced it
        (None, Some(e)) if ancestor.is_none() => Some(e.clone()),
        (None, _) => None,
    }
}

fn merge_arrays(ancestor: &[Value], later: &[Value], earlier: &[Value]) -> Vec<Value> {
    let mut out: Vec<Value> = later.to_vec();
    for item in earlier {
        if !later.contains(item) && !ancestor.contains(item) && !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

fn merge_objects(ancestor: &Map<String, Value>, later: &Map<String, Value>, earlier: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, l) in later {
        let merged = match earlier.get(key) {
            Some(e) => merge_value(ancestor.get(key), Some(l), Some(e)),
            None => Some(l.clone()),
        };
        if let Some(v) = merged {
            out.insert(key.clone(), v);
        }
    }
    for (key, e) in earlier {
        if !later.contains_key(key) && !ancestor.contains_key(key) {
            out.insert(key.clone(), e.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityKind, ParentRef};
    use serde_json::json;

    fn item(version: u64, ts: i64, status: &str, by: &str) -> EntitySnapshot {
        EntitySnapshot {
            kind: EntityKind::FireSafetyItem,
            id: "item-1".into(),
            parent_id: Some("room-1".into()),
            parent_kind: Some(EntityKind::Room),
            version,
            base_version: 2,
            fields: json!({"item_type": "extinguisher", "status": status}),
            deleted: false,
            local_timestamp: ts,
            created_at: 10,
            origin: "mobile".into(),
            modified_by: by.into(),
        }
    }

    fn room(version: u64, ts: i64, connections: Value, layout: Value, by: &str) -> EntitySnapshot {
        let mut r = EntitySnapshot::new(
            EntityKind::Room,
            Some(ParentRef::new(EntityKind::Floor, "floor-1")),
            json!({"room_name": "Kitchen", "connections": connections, "schematic_layout": layout}),
            by,
        );
        r.id = "room-1".into();
        r.version = version;
        r.local_timestamp = ts;
        r.created_at = 1;
        r.origin = "mobile".into();
        r
    }

    #[test]
    fn test_later_timestamp_wins_scalars() {
        let resolver = ConflictResolver::new("server");
        let local = item(3, 1_000, "fail", "mobile");
        let remote = item(3, 2_000, "pass", "server");

        let resolved = resolver.resolve(&local, &remote, &CommonAncestor::version_only(2));
        assert_eq!(resolved.fields["status"], "pass");
        assert_eq!(resolved.version, 4);
        assert_eq!(resolved.base_version, 3);
        assert_eq!(resolved.modified_by, "server");
        assert_eq!(resolved.local_timestamp, 2_000);
    }

    #[test]
    fn test_resolution_is_commutative() {
        let resolver = ConflictResolver::new("server");
        let a = item(3, 1_000, "fail", "mobile");
        let b = item(5, 900, "pass", "tablet");
        let anc = CommonAncestor::version_only(2);

        assert_eq!(resolver.resolve(&a, &b, &anc), resolver.resolve(&b, &a, &anc));
    }

    #[test]
    fn test_timestamp_tie_goes_to_authority() {
        let resolver = ConflictResolver::new("server");
        let mobile = item(3, 1_000, "fail", "mobile");
        let server = item(3, 1_000, "pass", "server");

        let resolved = resolver.resolve(&mobile, &server, &CommonAncestor::version_only(2));
        assert_eq!(resolved.fields["status"], "pass");
    }

    #[test]
    fn test_full_tie_broken_by_content_hash() {
        let resolver = ConflictResolver::new("server");
        let a = item(3, 1_000, "fail", "mobile");
        let b = item(3, 1_000, "pass", "tablet");
        let expected = if a.content_hash() > b.content_hash() { "fail" } else { "pass" };

        let resolved = resolver.resolve(&a, &b, &CommonAncestor::version_only(2));
        assert_eq!(resolved.fields["status"], expected);
        assert_eq!(resolver.resolve(&b, &a, &CommonAncestor::version_only(2)), resolved);
    }

    #[test]
    fn test_fast_path_takes_changed_side() {
        let resolver = ConflictResolver::new("server");
        let unchanged = item(2, 5_000, "fail", "mobile");
        let changed = item(3, 1_000, "pass", "server");

        let resolved = resolver.resolve(&unchanged, &changed, &CommonAncestor::version_only(2));
        // the changed side wins even though it is older
        assert_eq!(resolved.fields["status"], "pass");
        assert_eq!(resolved.version, 4);
    }

    #[test]
    fn test_later_tombstone_wins() {
        let resolver = ConflictResolver::new("server");
        let live = item(3, 1_000, "pass", "mobile");
        let mut tomb = item(3, 2_000, "pass", "tablet");
        tomb.deleted = true;

        assert!(resolver.resolve(&live, &tomb, &CommonAncestor::version_only(2)).deleted);
    }

    #[test]
    fn test_later_live_edit_beats_earlier_tombstone() {
        let resolver = ConflictResolver::new("server");
        let mut tomb = item(3, 1_000, "pass", "mobile");
        tomb.deleted = true;
        let live = item(3, 2_000, "fail", "tablet");

        let resolved = resolver.resolve(&tomb, &live, &CommonAncestor::version_only(2));
        assert!(!resolved.deleted);
        assert_eq!(resolved.fields["status"], "fail");
    }

    #[test]
    fn test_connections_union_of_additions() {
        let resolver = ConflictResolver::new("server");
        let ancestor = room(2, 500, json!(["r-a"]), Value::Null, "mobile");
        let local = room(3, 1_000, json!(["r-a", "r-b"]), Value::Null, "mobile");
        let remote = room(3, 2_000, json!(["r-a", "r-c"]), Value::Null, "tablet");

        let resolved = resolver.resolve(&local, &remote, &CommonAncestor::new(2, Some(ancestor)));
        assert_eq!(resolved.fields["connections"], json!(["r-a", "r-c", "r-b"]));
    }

    #[test]
    fn test_removal_only_by_later_side() {
        let resolver = ConflictResolver::new("server");
        let ancestor = room(2, 500, json!(["r-a", "r-b"]), Value::Null, "mobile");
        // earlier side removed r-a, later side removed r-b
        let earlier = room(3, 1_000, json!(["r-b"]), Value::Null, "mobile");
        let later = room(3, 2_000, json!(["r-a"]), Value::Null, "tablet");

        let resolved = resolver.resolve(&earlier, &later, &CommonAncestor::new(2, Some(ancestor)));
        assert_eq!(resolved.fields["connections"], json!(["r-a"]));
    }

    #[test]
    fn test_without_ancestor_snapshot_arrays_union() {
        let resolver = ConflictResolver::new("server");
        let earlier = room(3, 1_000, json!(["r-b"]), Value::Null, "mobile");
        let later = room(3, 2_000, json!(["r-a"]), Value::Null, "tablet");

        let resolved = resolver.resolve(&earlier, &later, &CommonAncestor::version_only(2));
        assert_eq!(resolved.fields["connections"], json!(["r-a", "r-b"]));
    }

    #[test]
    fn test_layout_merges_keywise() {
        let resolver = ConflictResolver::new("server");
        let ancestor = room(2, 500, json!([]), json!({"walls": [1], "door": {"x": 1}}), "mobile");
        let earlier = room(3, 1_000, json!([]), json!({"walls": [1, 2], "door": {"x": 1}, "window": 7}), "mobile");
        let later = room(3, 2_000, json!([]), json!({"walls": [1, 3], "door": {"x": 9}}), "tablet");

        let resolved = resolver.resolve(&earlier, &later, &CommonAncestor::new(2, Some(ancestor)));
        assert_eq!(
            resolved.fields["schematic_layout"],
            json!({"walls": [1, 3, 2], "door": {"x": 9}, "window": 7})
        );
        assert_eq!(resolved.fields["room_name"], "Kitchen");
    }

    #[test]
    fn test_later_side_dropping_layout_removes_it() {
        let resolver = ConflictResolver::new("server");
        let ancestor = room(2, 500, json!([]), json!({"walls": [1]}), "mobile");
        let earlier = room(3, 1_000, json!([]), json!({"walls": [1, 2]}), "mobile");
        let later = room(3, 2_000, json!([]), Value::Null, "tablet");

        let resolved = resolver.resolve(&earlier, &later, &CommonAncestor::new(2, Some(ancestor)));
        assert!(resolved.fields.get("schematic_layout").is_none());
    }

    #[test]
    fn test_creation_metadata_from_earliest() {
        let resolver = ConflictResolver::new("server");
        let mut a = item(3, 1_000, "fail", "mobile");
        let mut b = item(3, 2_000, "pass", "server");
        a.created_at = 50;
        a.origin = "tablet".into();
        b.created_at = 20;
        b.origin = "mobile".into();

        let resolved = resolver.resolve(&a, &b, &CommonAncestor::version_only(2));
        assert_eq!(resolved.created_at, 20);
        assert_eq!(resolved.origin, "mobile");
    }
}
