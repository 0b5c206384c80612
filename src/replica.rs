// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One copy of the inspection dataset.
//!
//! A [`Replica`] wraps a [`ReplicaStore`] with two write paths:
//!
//! - **Local edits** (`create`, `update`, `soft_delete`): validated, versioned
//!   and logged as [`ChangeSource::Local`] so the next session pushes them.
//! - **Batch apply** ([`Replica::apply_batch`]): the acceptance rule used by
//!   both the server (for pushed entities) and the client (for resolved
//!   snapshots and the remote delta). The rule does not know which side it
//!   runs on; the caller supplies the horizon checkpoint against which
//!   "modified since" is judged.
//!
//! # Acceptance rule
//!
//! For incoming `e`, stored `s`, horizon `h`:
//!
//! 1. invalid fields or parent kind: rejected (schema mismatch)
//! 2. no `s`: parent check, store
//! 3. same version and content: accepted, nothing written
//! 4. `e` derived from `s` or later: fast-forward
//! 5. `s` untouched since `h`: newer `e` is stored, older `e` is stale and
//!    answered with `s`
//! 6. otherwise both changed: merge via [`ConflictResolver`]
//!
//! Every write passes the parent check. A missing parent, or a tombstoned
//! one under a live child, defers the entity until the rest of the batch has
//! been applied; whatever is still deferred when no progress is made is
//! rejected as orphaned.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::checkpoint::Checkpoint;
use crate::config::SyncConfig;
use crate::entity::{ChangeSource, EntityKey, EntityKind, EntitySnapshot, ParentRef};
use crate::metrics;
use crate::model::{validate_fields, EntityFields};
use crate::protocol::{EntityResult, Outcome, RejectReason};
use crate::resolver::{CommonAncestor, ConflictResolver};
use crate::storage::{self, BlobStore, ChangeLog, EntityStore, PutOutcome, ReplicaStore, StorageError};

#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("{0} not found")]
    NotFound(EntityKey),
    #[error("{0} is deleted")]
    Deleted(EntityKey),
    #[error("invalid fields: {0}")]
    InvalidFields(String),
    #[error("{kind} cannot be owned by {parent:?}")]
    InvalidParent {
        kind: EntityKind,
        parent: Option<EntityKind>,
    },
    #[error("parent {0} is missing or deleted")]
    ParentUnavailable(EntityKey),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of applying one incoming snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Stored (or already present); `version` is what the replica now holds
    Accepted { version: u64 },
    /// The sender must adopt `snapshot`. `merged` is false when the incoming
    /// snapshot was simply stale.
    Resolved { snapshot: EntitySnapshot, merged: bool },
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyResult {
    pub kind: EntityKind,
    pub id: String,
    pub outcome: ApplyOutcome,
}

impl ApplyResult {
    /// Version the replica holds for this entity after the apply.
    #[must_use]
    pub fn final_version(&self) -> Option<u64> {
        match &self.outcome {
            ApplyOutcome::Accepted { version } => Some(*version),
            ApplyOutcome::Resolved { snapshot, .. } => Some(snapshot.version),
            ApplyOutcome::Rejected(_) => None,
        }
    }

    #[must_use]
    pub fn is_orphaned(&self) -> bool {
        matches!(self.outcome, ApplyOutcome::Rejected(RejectReason::OrphanedEntity))
    }

    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey { kind: self.kind, id: self.id.clone() }
    }

    /// Wire form of this result.
    #[must_use]
    pub fn into_entity_result(self) -> EntityResult {
        let (outcome, resolved_snapshot) = match self.outcome {
            ApplyOutcome::Accepted { .. } => (Outcome::Accepted, None),
            ApplyOutcome::Resolved { snapshot, .. } => (Outcome::ConflictResolved, Some(snapshot)),
            ApplyOutcome::Rejected(reason) => (Outcome::Rejected { reason }, None),
        };
        EntityResult {
            id: self.id,
            kind: self.kind,
            outcome,
            resolved_snapshot,
        }
    }
}

enum Step {
    Done(ApplyOutcome),
    Deferred,
}

pub struct Replica {
    id: String,
    store: Arc<dyn ReplicaStore>,
    resolver: ConflictResolver,
    /// Serializes read-modify-write cycles (local edits and batch apply)
    write_lock: Mutex<()>,
}

impl Replica {
    /// `authority` is the replica id that wins timestamp ties in conflicts.
    pub fn new(id: impl Into<String>, store: Arc<dyn ReplicaStore>, authority: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            store,
            resolver: ConflictResolver::new(authority),
            write_lock: Mutex::new(()),
        }
    }

    /// Open the store named by `config` and wrap it as a replica.
    /// Also returns the backend's blob store for photo transfer.
    pub async fn open(config: &SyncConfig) -> Result<(Self, Arc<dyn BlobStore>), StorageError> {
        let opened = storage::open(config.database_url.as_deref()).await?;
        let replica = Self::new(config.replica_id.clone(), opened.replica, config.authority_replica_id.clone());
        Ok((replica, opened.blobs))
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ReplicaStore> {
        &self.store
    }

    #[must_use]
    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    // ----- reads -----

    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntitySnapshot>, StorageError> {
        self.store.get(kind, id).await
    }

    /// Typed view of a stored entity's attributes.
    pub async fn get_typed<F: EntityFields>(&self, id: &str) -> Result<Option<F>, ReplicaError> {
        match self.store.get(F::KIND, id).await? {
            Some(snapshot) => F::from_value(&snapshot.fields)
                .map(Some)
                .map_err(|e| ReplicaError::InvalidFields(e.to_string())),
            None => Ok(None),
        }
    }

    /// Children of `parent_id`, ordered by creation time then id. Tombstones included.
    pub async fn list_children(&self, parent_id: &str, kind: EntityKind) -> Result<Vec<EntitySnapshot>, StorageError> {
        self.store.list_children(parent_id, kind).await
    }

    /// Whether the entity or any owning ancestor is tombstoned.
    ///
    /// Photos are back-references and never inherit a parent's tombstone.
    /// Unknown entities are not deleted.
    pub async fn is_effectively_deleted(&self, kind: EntityKind, id: &str) -> Result<bool, StorageError> {
        match self.store.get(kind, id).await? {
            Some(snapshot) => self.chain_deleted(&snapshot).await,
            None => Ok(false),
        }
    }

    async fn chain_deleted(&self, snapshot: &EntitySnapshot) -> Result<bool, StorageError> {
        if snapshot.deleted {
            return Ok(true);
        }
        if snapshot.kind == EntityKind::Photo {
            return Ok(false);
        }
        let mut next = snapshot.parent();
        while let Some(parent) = next {
            match self.store.get(parent.kind, &parent.id).await? {
                Some(p) if p.deleted => return Ok(true),
                Some(p) => next = p.parent(),
                None => return Ok(false),
            }
        }
        Ok(false)
    }

    // ----- local edits -----

    /// Create a new entity owned by `parent` (None for assessments).
    #[instrument(skip(self, attrs), fields(replica = %self.id))]
    pub async fn create(&self, kind: EntityKind, parent: Option<ParentRef>, attrs: Value) -> Result<EntitySnapshot, ReplicaError> {
        validate_fields(kind, &attrs).map_err(ReplicaError::InvalidFields)?;
        let parent_kind = parent.as_ref().map(|p| p.kind);
        if !kind.accepts_parent(parent_kind) {
            return Err(ReplicaError::InvalidParent { kind, parent: parent_kind });
        }

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = &parent {
            let usable = match self.store.get(parent.kind, &parent.id).await? {
                Some(p) => kind == EntityKind::Photo || !self.chain_deleted(&p).await?,
                None => false,
            };
            if !usable {
                return Err(ReplicaError::ParentUnavailable(EntityKey { kind: parent.kind, id: parent.id.clone() }));
            }
        }

        let snapshot = EntitySnapshot::new(kind, parent, attrs, &self.id);
        self.store.put(&snapshot, ChangeSource::Local).await?;
        debug!(kind = %kind, id = %snapshot.id, "Created entity");
        Ok(snapshot)
    }

    pub async fn create_typed<F: EntityFields>(&self, parent: Option<ParentRef>, fields: &F) -> Result<EntitySnapshot, ReplicaError> {
        let attrs = fields.to_value().map_err(|e| ReplicaError::InvalidFields(e.to_string()))?;
        self.create(F::KIND, parent, attrs).await
    }

    /// Replace an entity's attributes, producing the next version.
    #[instrument(skip(self, attrs), fields(replica = %self.id))]
    pub async fn update(&self, kind: EntityKind, id: &str, attrs: Value) -> Result<EntitySnapshot, ReplicaError> {
        validate_fields(kind, &attrs).map_err(ReplicaError::InvalidFields)?;

        let _guard = self.write_lock.lock().await;
        let current = self.require_live(kind, id).await?;
        let mut next = current.next_version(&self.id);
        next.fields = attrs;
        self.store.put(&next, ChangeSource::Local).await?;
        debug!(kind = %kind, id = %id, version = next.version, "Updated entity");
        Ok(next)
    }

    pub async fn update_typed<F: EntityFields>(&self, id: &str, fields: &F) -> Result<EntitySnapshot, ReplicaError> {
        let attrs = fields.to_value().map_err(|e| ReplicaError::InvalidFields(e.to_string()))?;
        self.update(F::KIND, id, attrs).await
    }

    /// Tombstone an entity. Descendants become implicitly deleted but keep
    /// their own records.
    #[instrument(skip(self), fields(replica = %self.id))]
    pub async fn soft_delete(&self, kind: EntityKind, id: &str) -> Result<EntitySnapshot, ReplicaError> {
        let _guard = self.write_lock.lock().await;
        let current = self.require_live(kind, id).await?;
        let mut next = current.next_version(&self.id);
        next.deleted = true;
        self.store.put(&next, ChangeSource::Local).await?;
        debug!(kind = %kind, id = %id, version = next.version, "Soft-deleted entity");
        Ok(next)
    }

    async fn require_live(&self, kind: EntityKind, id: &str) -> Result<EntitySnapshot, ReplicaError> {
        let key = EntityKey { kind, id: id.to_string() };
        match self.store.get(kind, id).await? {
            Some(s) if s.deleted => Err(ReplicaError::Deleted(key)),
            Some(s) => Ok(s),
            None => Err(ReplicaError::NotFound(key)),
        }
    }

    // ----- batch apply -----

    /// Apply snapshots from the peer. Results come back in input order.
    ///
    /// Entities are applied parents first (stable by kind depth); deferred
    /// ones are retried until a full pass makes no progress.
    #[instrument(skip(self, incoming), fields(replica = %self.id, count = incoming.len(), horizon = %horizon))]
    pub async fn apply_batch(&self, incoming: &[EntitySnapshot], horizon: Checkpoint) -> Result<Vec<ApplyResult>, StorageError> {
        let _guard = self.write_lock.lock().await;

        let mut order: Vec<usize> = (0..incoming.len()).collect();
        order.sort_by_key(|&i| incoming[i].kind.depth());

        let mut outcomes: Vec<Option<ApplyOutcome>> = vec![None; incoming.len()];
        let mut pending = Vec::new();

        for i in order {
            match self.apply_one(&incoming[i], horizon).await? {
                Step::Done(outcome) => outcomes[i] = Some(outcome),
                Step::Deferred => pending.push(i),
            }
        }

        while !pending.is_empty() {
            let mut still_pending = Vec::new();
            for &i in &pending {
                match self.apply_one(&incoming[i], horizon).await? {
                    Step::Done(outcome) => outcomes[i] = Some(outcome),
                    Step::Deferred => still_pending.push(i),
                }
            }
            if still_pending.len() == pending.len() {
                break;
            }
            pending = still_pending;
        }

        for &i in &pending {
            let e = &incoming[i];
            warn!(kind = %e.kind, id = %e.id, parent = ?e.parent_id, "Orphaned entity, parent unavailable");
            metrics::record_orphan(e.kind);
            outcomes[i] = Some(ApplyOutcome::Rejected(RejectReason::OrphanedEntity));
        }

        Ok(incoming
            .iter()
            .zip(outcomes)
            .map(|(e, outcome)| ApplyResult {
                kind: e.kind,
                id: e.id.clone(),
                outcome: outcome.unwrap_or(ApplyOutcome::Rejected(RejectReason::OrphanedEntity)),
            })
            .collect())
    }

    async fn apply_one(&self, e: &EntitySnapshot, horizon: Checkpoint) -> Result<Step, StorageError> {
        if let Err(reason) = check_shape(e) {
            debug!(kind = %e.kind, id = %e.id, %reason, "Rejected incoming snapshot");
            metrics::record_rejection(e.kind, "schema_mismatch");
            return Ok(Step::Done(ApplyOutcome::Rejected(RejectReason::SchemaMismatch(reason))));
        }

        let stored = match self.store.get(e.kind, &e.id).await? {
            Some(s) => s,
            None => return self.write_checked(e, ChangeSource::Replicated).await,
        };

        if stored.same_state_as(e) {
            return Ok(Step::Done(ApplyOutcome::Accepted { version: stored.version }));
        }

        if e.version > stored.version && e.base_version >= stored.version {
            return self.write_checked(e, ChangeSource::Replicated).await;
        }

        let dirty = self
            .store
            .latest_seq(e.kind, &e.id)
            .await?
            .is_some_and(|seq| seq > horizon);

        if !dirty {
            if e.version > stored.version {
                return self.write_checked(e, ChangeSource::Replicated).await;
            }
            if e.version < stored.version {
                debug!(kind = %e.kind, id = %e.id, incoming = e.version, stored = stored.version, "Stale snapshot");
                return Ok(Step::Done(ApplyOutcome::Resolved { snapshot: stored, merged: false }));
            }
        }

        let ancestor = self.common_ancestor(&stored, e).await?;
        if ancestor.version == e.version && ancestor.snapshot.is_some() {
            // incoming is already part of the stored history
            return Ok(Step::Done(ApplyOutcome::Resolved { snapshot: stored, merged: false }));
        }

        let merged = self.resolver.resolve(&stored, e, &ancestor);
        if !self.parent_ready(&merged).await? {
            return Ok(Step::Deferred);
        }
        self.store.put(&merged, ChangeSource::Local).await?;
        metrics::record_conflict(e.kind);
        debug!(
            kind = %e.kind,
            id = %e.id,
            local = stored.version,
            remote = e.version,
            ancestor = ancestor.version,
            merged = merged.version,
            "Resolved conflict"
        );
        Ok(Step::Done(ApplyOutcome::Resolved { snapshot: merged, merged: true }))
    }

    async fn write_checked(&self, e: &EntitySnapshot, source: ChangeSource) -> Result<Step, StorageError> {
        if !self.parent_ready(e).await? {
            return Ok(Step::Deferred);
        }
        let outcome = self.store.put(e, source).await?;
        let version = match outcome {
            PutOutcome::Stored { .. } => e.version,
            PutOutcome::Unchanged { stored_version } => stored_version,
        };
        Ok(Step::Done(ApplyOutcome::Accepted { version }))
    }

    async fn parent_ready(&self, e: &EntitySnapshot) -> Result<bool, StorageError> {
        let Some(parent) = e.parent() else {
            return Ok(true);
        };
        let Some(p) = self.store.get(parent.kind, &parent.id).await? else {
            return Ok(false);
        };
        if e.kind == EntityKind::Photo || e.deleted {
            return Ok(true);
        }
        Ok(!self.chain_deleted(&p).await?)
    }

    /// Last version both sides share.
    ///
    /// If the incoming snapshot appears in the stored entity's own history it
    /// is the ancestor. Otherwise the older of the two base versions.
    async fn common_ancestor(&self, stored: &EntitySnapshot, incoming: &EntitySnapshot) -> Result<CommonAncestor, StorageError> {
        if stored.base_version >= incoming.version {
            if let Some(past) = self.store.snapshot_at(incoming.kind, &incoming.id, incoming.version).await? {
                if past.content_hash() == incoming.content_hash() {
                    return Ok(CommonAncestor::new(incoming.version, Some(past)));
                }
            }
        }

        let version = stored.base_version.min(incoming.base_version);
        let snapshot = if version == 0 {
            None
        } else {
            self.store.snapshot_at(incoming.kind, &incoming.id, version).await?
        };
        Ok(CommonAncestor::new(version, snapshot))
    }
}

/// Structural checks that don't need the store.
fn check_shape(e: &EntitySnapshot) -> Result<(), String> {
    if e.version == 0 {
        return Err("version must be at least 1".to_string());
    }
    if e.base_version >= e.version {
        return Err(format!("base version {} not below version {}", e.base_version, e.version));
    }
    if e.parent_id.is_some() != e.parent_kind.is_some() {
        return Err("parent id and parent kind must be given together".to_string());
    }
    if !e.kind.accepts_parent(e.parent_kind) {
        return Err(format!("{} cannot be owned by {:?}", e.kind, e.parent_kind));
    }
    validate_fields(e.kind, &e.fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssessmentFields, FireSafetyItemFields, ItemStatus};
    use crate::storage::{ChangeLog, InMemoryStore};
    use serde_json::json;

    fn replica(id: &str) -> Replica {
        Replica::new(id, Arc::new(InMemoryStore::new()), "server")
    }

    fn assessment_fields(name: &str) -> Value {
        json!({"property_name": name})
    }

    async fn chain(r: &Replica) -> (EntitySnapshot, EntitySnapshot, EntitySnapshot) {
        let a = r.create(EntityKind::Assessment, None, assessment_fields("HQ")).await.unwrap();
        let f = r
            .create(EntityKind::Floor, Some(ParentRef::new(EntityKind::Assessment, a.id.clone())), json!({"floor_number": 1}))
            .await
            .unwrap();
        let room = r
            .create(EntityKind::Room, Some(ParentRef::new(EntityKind::Floor, f.id.clone())), json!({"room_name": "Lobby"}))
            .await
            .unwrap();
        (a, f, room)
    }

    #[tokio::test]
    async fn test_typed_serialization_failure_is_reported() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct GridRoom {
            cells: std::collections::HashMap<(i32, i32), String>,
        }
        impl EntityFields for GridRoom {
            const KIND: EntityKind = EntityKind::Room;
        }

        let r = replica("mobile");
        let (_, f, room) = chain(&r).await;
        let grid = GridRoom { cells: [((0, 0), "door".to_string())].into_iter().collect() };

        match r.create_typed(Some(ParentRef::new(EntityKind::Floor, f.id.clone())), &grid).await {
            Err(ReplicaError::InvalidFields(msg)) => assert!(msg.contains("key must be a string"), "{}", msg),
            other => panic!("expected InvalidFields, got {:?}", other),
        }
        assert!(matches!(r.update_typed(&room.id, &grid).await, Err(ReplicaError::InvalidFields(_))));
        assert_eq!(r.get(EntityKind::Room, &room.id).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_create_validates_fields_and_parent() {
        let r = replica("mobile");
        assert!(matches!(
            r.create(EntityKind::Assessment, None, json!({"notes": "no name"})).await,
            Err(ReplicaError::InvalidFields(_))
        ));
        assert!(matches!(
            r.create(EntityKind::Floor, None, json!({})).await,
            Err(ReplicaError::InvalidParent { .. })
        ));
        assert!(matches!(
            r.create(EntityKind::Floor, Some(ParentRef::new(EntityKind::Assessment, "missing")), json!({})).await,
            Err(ReplicaError::ParentUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_base() {
        let r = replica("mobile");
        let a = r.create(EntityKind::Assessment, None, assessment_fields("HQ")).await.unwrap();
        let v2 = r.update(EntityKind::Assessment, &a.id, assessment_fields("HQ North")).await.unwrap();

        assert_eq!(v2.version, 2);
        assert_eq!(v2.base_version, 1);
        let typed: AssessmentFields = r.get_typed(&a.id).await.unwrap().unwrap();
        assert_eq!(typed.property_name, "HQ North");
    }

    #[tokio::test]
    async fn test_soft_delete_cascades_implicitly() {
        let r = replica("mobile");
        let (a, f, room) = chain(&r).await;
        let photo = r
            .create(EntityKind::Photo, Some(ParentRef::new(EntityKind::Room, room.id.clone())), json!({"caption": "door"}))
            .await
            .unwrap();

        r.soft_delete(EntityKind::Assessment, &a.id).await.unwrap();

        assert!(r.is_effectively_deleted(EntityKind::Floor, &f.id).await.unwrap());
        assert!(r.is_effectively_deleted(EntityKind::Room, &room.id).await.unwrap());
        assert!(!r.is_effectively_deleted(EntityKind::Photo, &photo.id).await.unwrap());
        // children keep their own records
        assert!(!r.get(EntityKind::Room, &room.id).await.unwrap().unwrap().deleted);
        assert!(matches!(
            r.update(EntityKind::Assessment, &a.id, assessment_fields("x")).await,
            Err(ReplicaError::Deleted(_))
        ));
        assert!(matches!(
            r.create(EntityKind::Floor, Some(ParentRef::new(EntityKind::Assessment, a.id.clone())), json!({})).await,
            Err(ReplicaError::ParentUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_parent_and_child_in_one_batch_any_order() {
        let client = replica("mobile");
        let (a, f, room) = chain(&client).await;
        let server = replica("server");

        let results = server.apply_batch(&[room.clone(), f.clone(), a.clone()], Checkpoint::ZERO).await.unwrap();
        assert!(results.iter().all(|r| r.outcome == ApplyOutcome::Accepted { version: 1 }));
        assert_eq!(results[0].id, room.id);
        assert_eq!(server.get(EntityKind::Room, &room.id).await.unwrap(), Some(room));
    }

    #[tokio::test]
    async fn test_apply_orphan_rejected() {
        let client = replica("mobile");
        let (_a, f, _room) = chain(&client).await;
        let server = replica("server");

        let results = server.apply_batch(&[f.clone()], Checkpoint::ZERO).await.unwrap();
        assert!(results[0].is_orphaned());
        assert!(server.get(EntityKind::Floor, &f.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_live_child_under_tombstone_is_orphaned() {
        let server = replica("server");
        let client = replica("mobile");
        let (a, f, _room) = chain(&client).await;
        server.apply_batch(&[a.clone(), f.clone()], Checkpoint::ZERO).await.unwrap();
        server.soft_delete(EntityKind::Assessment, &a.id).await.unwrap();

        let f2 = client.update(EntityKind::Floor, &f.id, json!({"floor_number": 2})).await.unwrap();
        let results = server.apply_batch(&[f2], Checkpoint::from_seq(100)).await.unwrap();
        assert!(results[0].is_orphaned());

        // a tombstone under a tombstone is fine
        let f_del = client.soft_delete(EntityKind::Floor, &f.id).await.unwrap();
        let results = server.apply_batch(&[f_del], Checkpoint::from_seq(100)).await.unwrap();
        assert_eq!(results[0].outcome, ApplyOutcome::Accepted { version: 3 });
    }

    #[tokio::test]
    async fn test_apply_schema_mismatch() {
        let server = replica("server");
        let mut bad = EntitySnapshot::new(EntityKind::FireSafetyItem, None, json!({}), "mobile");
        let results = server.apply_batch(&[bad.clone()], Checkpoint::ZERO).await.unwrap();
        assert!(matches!(results[0].outcome, ApplyOutcome::Rejected(RejectReason::SchemaMismatch(_))));

        bad.parent_kind = Some(EntityKind::Room);
        bad.parent_id = Some("r-1".into());
        bad.fields = json!({"status": "broken"});
        let results = server.apply_batch(&[bad], Checkpoint::ZERO).await.unwrap();
        assert!(matches!(results[0].outcome, ApplyOutcome::Rejected(RejectReason::SchemaMismatch(_))));
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let client = replica("mobile");
        let (a, _, _) = chain(&client).await;
        let server = replica("server");

        server.apply_batch(&[a.clone()], Checkpoint::ZERO).await.unwrap();
        let head = server.store().head().await.unwrap();
        let again = server.apply_batch(&[a.clone()], Checkpoint::ZERO).await.unwrap();

        assert_eq!(again[0].outcome, ApplyOutcome::Accepted { version: 1 });
        assert_eq!(server.store().head().await.unwrap(), head);
    }

    #[tokio::test]
    async fn test_apply_fast_forward_over_dirty_entity() {
        let server = replica("server");
        let client = replica("mobile");
        let a = client.create(EntityKind::Assessment, None, assessment_fields("HQ")).await.unwrap();
        server.apply_batch(&[a.clone()], Checkpoint::ZERO).await.unwrap();

        let v2 = client.update(EntityKind::Assessment, &a.id, assessment_fields("HQ 2")).await.unwrap();
        // horizon 0: the server's copy counts as modified, but v2 derives from v1
        let results = server.apply_batch(&[v2.clone()], Checkpoint::ZERO).await.unwrap();
        assert_eq!(results[0].outcome, ApplyOutcome::Accepted { version: 2 });
    }

    #[tokio::test]
    async fn test_apply_stale_returns_stored() {
        let server = replica("server");
        let a = server.create(EntityKind::Assessment, None, assessment_fields("HQ")).await.unwrap();
        let v2 = server.update(EntityKind::Assessment, &a.id, assessment_fields("HQ 2")).await.unwrap();
        let head = server.store().head().await.unwrap();

        let results = server.apply_batch(&[a], head).await.unwrap();
        assert_eq!(results[0].outcome, ApplyOutcome::Resolved { snapshot: v2, merged: false });
        assert_eq!(server.store().head().await.unwrap(), head);
    }

    #[tokio::test]
    async fn test_apply_concurrent_edit_merges() {
        let server = replica("server");
        let client = replica("mobile");
        let (_, _, room) = chain(&client).await;

        // seed the server with the same chain
        let all: Vec<EntitySnapshot> = client
            .store()
            .entries_since(Checkpoint::ZERO)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.snapshot)
            .collect();
        server.apply_batch(&all, Checkpoint::ZERO).await.unwrap();
        let seeded = server.store().head().await.unwrap();

        let item_fields = |status: ItemStatus| FireSafetyItemFields { status, item_type: Some("extinguisher".into()), ..Default::default() };
        let item = client
            .create_typed(Some(ParentRef::new(EntityKind::Room, room.id.clone())), &item_fields(ItemStatus::Pass))
            .await
            .unwrap();
        server.apply_batch(&[item.clone()], seeded).await.unwrap();
        let synced = server.store().head().await.unwrap();

        // both edit v1 independently
        let server_v2 = server.update_typed(&item.id, &item_fields(ItemStatus::Fail)).await.unwrap();
        let mut client_v2 = client.update_typed(&item.id, &item_fields(ItemStatus::Pass)).await.unwrap();
        client_v2.fields["notes"] = json!("checked");
        client_v2.local_timestamp = server_v2.local_timestamp + 1_000;

        let results = server.apply_batch(&[client_v2.clone()], synced).await.unwrap();
        match &results[0].outcome {
            ApplyOutcome::Resolved { snapshot, merged: true } => {
                assert_eq!(snapshot.version, 3);
                assert_eq!(snapshot.base_version, 2);
                assert_eq!(snapshot.fields["notes"], "checked");
                assert_eq!(snapshot.modified_by, "server");
            }
            other => panic!("expected merge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_in_memory_from_config() {
        let config = SyncConfig { replica_id: "tablet-3".into(), ..Default::default() };
        let (r, blobs) = Replica::open(&config).await.unwrap();
        assert_eq!(r.id(), "tablet-3");
        assert_eq!(r.resolver().authority(), "server");
        let hash = blobs.put_blob(b"jpeg").await.unwrap();
        assert!(blobs.has_blob(&hash).await.unwrap());
    }

    #[test]
    fn test_into_entity_result() {
        let result = ApplyResult {
            kind: EntityKind::Room,
            id: "r-1".into(),
            outcome: ApplyOutcome::Rejected(RejectReason::OrphanedEntity),
        };
        let wire = result.into_entity_result();
        assert_eq!(wire.outcome, Outcome::Rejected { reason: RejectReason::OrphanedEntity });
        assert!(wire.resolved_snapshot.is_none());
    }
}
