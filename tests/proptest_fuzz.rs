//! Property-based tests (fuzzing) for sync resilience.
//!
//! Uses proptest to generate random/malformed inputs and verify the engine
//! never panics, only returns clean errors, and that merges and sessions
//! converge regardless of input order.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{json, Value};

use inspection_sync::{
    ChangeLog, ChangeSource, Checkpoint, CommonAncestor, ConflictResolver, EntityKind, EntitySnapshot, EntityStore,
    InMemoryStore, LoopbackTransport, ParentRef, Replica, RetryConfig, SyncControl, SyncEngine, SyncRequest,
    SyncResponse, SyncServer,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        4,   // depth
        64,  // max nodes
        10,  // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..10).prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

fn kind_strategy() -> impl Strategy<Value = EntityKind> {
    prop::sample::select(EntityKind::ALL.to_vec())
}

/// Snapshot with a well-formed envelope and arbitrary attributes.
fn snapshot_strategy() -> impl Strategy<Value = EntitySnapshot> {
    (kind_strategy(), proptest::option::of(kind_strategy()), 0u64..5, 0u64..5, arbitrary_json_strategy(), any::<bool>())
        .prop_map(|(kind, parent_kind, version, base, fields, deleted)| EntitySnapshot {
            kind,
            id: format!("{}-fuzz", kind),
            parent_id: parent_kind.map(|k| format!("{}-fuzz", k)),
            parent_kind,
            version,
            base_version: base,
            fields,
            deleted,
            local_timestamp: 1_000,
            created_at: 1_000,
            origin: "fuzzer".into(),
            modified_by: "fuzzer".into(),
        })
}

const ROOMS: [&str; 4] = ["r-a", "r-b", "r-c", "r-d"];

/// One side of a room conflict: both derive from the same v2 ancestor.
fn room_side_strategy() -> impl Strategy<Value = EntitySnapshot> {
    (
        3u64..6,
        0i64..3,
        prop::sample::select(vec!["server", "tablet-1", "tablet-2"]),
        prop::sample::subsequence(ROOMS.to_vec(), 0..=ROOMS.len()),
        prop::sample::select(vec!["Lobby", "Plant room", "Stair core"]),
        any::<bool>(),
    )
        .prop_map(|(version, ts, by, connections, name, deleted)| EntitySnapshot {
            kind: EntityKind::Room,
            id: "room-1".into(),
            parent_id: Some("floor-1".into()),
            parent_kind: Some(EntityKind::Floor),
            version,
            base_version: 2,
            fields: json!({"room_name": name, "connections": connections}),
            deleted,
            local_timestamp: ts,
            created_at: ts,
            origin: by.to_string(),
            modified_by: by.to_string(),
        })
}

fn room_ancestor() -> EntitySnapshot {
    EntitySnapshot {
        kind: EntityKind::Room,
        id: "room-1".into(),
        parent_id: Some("floor-1".into()),
        parent_kind: Some(EntityKind::Floor),
        version: 2,
        base_version: 1,
        fields: json!({"room_name": "Lobby", "connections": ["r-a", "r-b"]}),
        deleted: false,
        local_timestamp: 0,
        created_at: 0,
        origin: "tablet-1".into(),
        modified_by: "tablet-1".into(),
    }
}

fn connections(snapshot: &EntitySnapshot) -> Vec<String> {
    serde_json::from_value(snapshot.fields["connections"].clone()).unwrap_or_default()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

// =============================================================================
// Deserialization Fuzz Tests
// =============================================================================

proptest! {
    /// Snapshot deserialization should never panic on arbitrary bytes
    #[test]
    fn fuzz_snapshot_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..4096)) {
        let _ = serde_json::from_slice::<EntitySnapshot>(&bytes);
    }

    /// Wire messages should never panic on arbitrary JSON
    #[test]
    fn fuzz_messages_from_arbitrary_json(json in arbitrary_json_strategy()) {
        let _ = serde_json::from_value::<SyncRequest>(json.clone());
        let _ = serde_json::from_value::<SyncResponse>(json.clone());
        let _ = serde_json::from_value::<EntitySnapshot>(json);
    }

    /// A serialized snapshot with one byte flipped must not panic the decoder
    #[test]
    fn fuzz_corrupted_snapshot(snapshot in snapshot_strategy(), position in any::<prop::sample::Index>(), byte in any::<u8>()) {
        let mut bytes = serde_json::to_vec(&snapshot).unwrap();
        let i = position.index(bytes.len());
        bytes[i] = byte;
        let _ = serde_json::from_slice::<EntitySnapshot>(&bytes);
    }
}

// =============================================================================
// Apply Fuzz Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Arbitrary pushed snapshots produce one clean result each, in input order
    #[test]
    fn fuzz_apply_arbitrary_batch(batch in prop::collection::vec(snapshot_strategy(), 0..8)) {
        let rt = runtime();
        let results = rt.block_on(async {
            let server = Replica::new("server", Arc::new(InMemoryStore::new()), "server");
            server.apply_batch(&batch, Checkpoint::ZERO).await.unwrap()
        });
        prop_assert_eq!(results.len(), batch.len());
        for (result, snapshot) in results.iter().zip(&batch) {
            prop_assert_eq!(&result.id, &snapshot.id);
        }
    }
}

// =============================================================================
// Resolver Properties
// =============================================================================

proptest! {
    /// Both replicas compute the same merge whichever side they call local
    #[test]
    fn prop_resolve_commutative(a in room_side_strategy(), b in room_side_strategy()) {
        let resolver = ConflictResolver::new("server");
        let ancestor = CommonAncestor::new(2, Some(room_ancestor()));
        prop_assert_eq!(resolver.resolve(&a, &b, &ancestor), resolver.resolve(&b, &a, &ancestor));
    }

    /// Resolving is deterministic
    #[test]
    fn prop_resolve_deterministic(a in room_side_strategy(), b in room_side_strategy()) {
        let resolver = ConflictResolver::new("server");
        let ancestor = CommonAncestor::new(2, Some(room_ancestor()));
        prop_assert_eq!(resolver.resolve(&a, &b, &ancestor), resolver.resolve(&a, &b, &ancestor));
    }

    /// The merge supersedes both inputs
    #[test]
    fn prop_merged_version_dominates(a in room_side_strategy(), b in room_side_strategy()) {
        let merged = ConflictResolver::new("server").resolve(&a, &b, &CommonAncestor::new(2, Some(room_ancestor())));
        prop_assert_eq!(merged.version, a.version.max(b.version) + 1);
        prop_assert_eq!(merged.base_version, a.version.max(b.version));
        prop_assert!(merged.local_timestamp >= a.local_timestamp.max(b.local_timestamp));
    }

    /// A connection either side added survives the merge
    #[test]
    fn prop_structural_additions_survive(a in room_side_strategy(), b in room_side_strategy()) {
        let ancestor = room_ancestor();
        let base = connections(&ancestor);
        let merged = ConflictResolver::new("server").resolve(&a, &b, &CommonAncestor::new(2, Some(ancestor)));
        let out = connections(&merged);
        for added in connections(&a).into_iter().chain(connections(&b)).filter(|c| !base.contains(c)) {
            prop_assert!(out.contains(&added), "lost {} in {:?}", added, out);
        }
    }
}

// =============================================================================
// Change Log Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Sequences are strictly increasing and compaction keeps exactly the tail
    #[test]
    fn prop_change_log_ordered(edits in 1usize..20, upto in 0u64..25) {
        let rt = runtime();
        rt.block_on(async {
            let store = InMemoryStore::new();
            let mut snapshot = EntitySnapshot::new(EntityKind::Assessment, None, json!({"property_name": "P"}), "t");
            for _ in 0..edits {
                store.put(&snapshot, ChangeSource::Local).await.unwrap();
                snapshot = snapshot.next_version("t");
            }
            let entries = store.entries_since(Checkpoint::ZERO).await.unwrap();
            assert_eq!(entries.len(), edits);
            assert!(entries.windows(2).all(|w| w[0].seq < w[1].seq));

            store.compact(Checkpoint::from_seq(upto)).await.unwrap();
            let kept = store.entries_since(Checkpoint::ZERO).await.unwrap();
            assert!(kept.iter().all(|e| e.seq > Checkpoint::from_seq(upto)));
            assert_eq!(kept.len(), edits.saturating_sub(upto as usize));
        });
    }
}

// =============================================================================
// Session Convergence
// =============================================================================

#[derive(Debug, Clone)]
enum Edit {
    Rename(&'static str),
    Connect(&'static str),
    Delete,
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        prop::sample::select(vec!["Lobby", "Plant room", "Stair core", "Office"]).prop_map(Edit::Rename),
        prop::sample::select(ROOMS.to_vec()).prop_map(Edit::Connect),
        Just(Edit::Delete),
    ]
}

async fn apply_edits(replica: &Replica, room_id: &str, edits: &[Edit]) {
    for edit in edits {
        let Some(current) = replica.get(EntityKind::Room, room_id).await.unwrap() else { return };
        if current.deleted {
            return;
        }
        match edit {
            Edit::Rename(name) => {
                let mut fields = current.fields.clone();
                fields["room_name"] = json!(name);
                replica.update(EntityKind::Room, room_id, fields).await.unwrap();
            }
            Edit::Connect(other) => {
                let mut fields = current.fields.clone();
                let mut links = connections(&current);
                if !links.iter().any(|l| l == other) {
                    links.push(other.to_string());
                }
                fields["connections"] = json!(links);
                replica.update(EntityKind::Room, room_id, fields).await.unwrap();
            }
            Edit::Delete => {
                replica.soft_delete(EntityKind::Room, room_id).await.unwrap();
            }
        }
    }
}

async fn dump(replica: &Replica) -> Vec<EntitySnapshot> {
    let mut all = Vec::new();
    for kind in EntityKind::ALL {
        all.extend(replica.store().list_kind(kind).await.unwrap());
    }
    all.sort_by_key(|s| s.key());
    all
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Offline edits on two tablets converge after each syncs and the first syncs again
    #[test]
    fn prop_two_tablets_converge(
        first in prop::collection::vec(edit_strategy(), 0..5),
        second in prop::collection::vec(edit_strategy(), 0..5),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let server = Arc::new(SyncServer::new(Arc::new(Replica::new("server", Arc::new(InMemoryStore::new()), "server"))));
            let tablet = |id: &str| {
                let replica = Arc::new(Replica::new(id, Arc::new(InMemoryStore::new()), "server"));
                SyncEngine::new(replica, Arc::new(LoopbackTransport::new(server.clone())), "server")
            };
            let control = SyncControl::new(Duration::from_secs(5), RetryConfig::test());
            let t1 = tablet("tablet-1");
            let t2 = tablet("tablet-2");

            let a = t1.replica().create(EntityKind::Assessment, None, json!({"property_name": "Mill"})).await.unwrap();
            let f = t1.replica()
                .create(EntityKind::Floor, Some(ParentRef::new(EntityKind::Assessment, a.id.clone())), json!({}))
                .await
                .unwrap();
            let room = t1.replica()
                .create(EntityKind::Room, Some(ParentRef::new(EntityKind::Floor, f.id.clone())), json!({"room_name": "Lobby", "connections": []}))
                .await
                .unwrap();
            t1.sync(&control).await.unwrap();
            t2.sync(&control).await.unwrap();

            apply_edits(t1.replica(), &room.id, &first).await;
            apply_edits(t2.replica(), &room.id, &second).await;

            t1.sync(&control).await.unwrap();
            t2.sync(&control).await.unwrap();
            t1.sync(&control).await.unwrap();

            let on_server = dump(server.replica()).await;
            assert_eq!(dump(t1.replica()).await, on_server);
            assert_eq!(dump(t2.replica()).await, on_server);
        });
    }
}
