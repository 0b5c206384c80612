// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity snapshot data structure.
//!
//! The [`EntitySnapshot`] is the unit that flows through the sync engine:
//! the full state of one assessment, floor, room, fire-safety item or photo
//! at one version. Snapshots are exchanged wholesale, never as field diffs.
//!
//! # Example
//!
//! ```
//! use inspection_sync::{EntityKind, EntitySnapshot};
//! use serde_json::json;
//!
//! let snapshot = EntitySnapshot::new(
//!     EntityKind::Assessment,
//!     None,
//!     json!({"property_name": "Sample Building"}),
//!     "mobile-1",
//! );
//!
//! assert_eq!(snapshot.version, 1);
//! assert_eq!(snapshot.base_version, 0);
//! assert!(!snapshot.deleted);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// The five levels of the inspection hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Assessment,
    Floor,
    Room,
    FireSafetyItem,
    Photo,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Assessment,
        EntityKind::Floor,
        EntityKind::Room,
        EntityKind::FireSafetyItem,
        EntityKind::Photo,
    ];

    /// Depth in the ownership tree. Applying in ascending depth puts parents first.
    #[must_use]
    pub fn depth(&self) -> u8 {
        match self {
            Self::Assessment => 0,
            Self::Floor => 1,
            Self::Room => 2,
            Self::FireSafetyItem => 3,
            Self::Photo => 4,
        }
    }

    /// Whether `parent` may own an entity of this kind.
    ///
    /// Photos hang off any non-photo entity; every other kind has exactly one
    /// owning kind; assessments are roots.
    #[must_use]
    pub fn accepts_parent(&self, parent: Option<EntityKind>) -> bool {
        match (self, parent) {
            (Self::Assessment, None) => true,
            (Self::Floor, Some(Self::Assessment)) => true,
            (Self::Room, Some(Self::Floor)) => true,
            (Self::FireSafetyItem, Some(Self::Room)) => true,
            (Self::Photo, Some(p)) => p != Self::Photo,
            _ => false,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assessment => "assessment",
            Self::Floor => "floor",
            Self::Room => "room",
            Self::FireSafetyItem => "fire_safety_item",
            Self::Photo => "photo",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owning (or, for photos, back-) reference from a child to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub kind: EntityKind,
    pub id: String,
}

impl ParentRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }
}

/// Identity of an entity across replicas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Where a change-log entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    /// Made on this replica (user edit or locally computed merge); must be pushed
    Local,
    /// Received from the peer; never echoed back
    Replicated,
}

impl ChangeSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Replicated => "replicated",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "replicated" => Some(Self::Replicated),
            _ => None,
        }
    }
}

/// Full representation of an entity at one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    pub kind: EntityKind,
    /// Client-generated UUID
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_kind: Option<EntityKind>,
    /// Monotonic per-entity version, never reused
    pub version: u64,
    /// Version this snapshot was derived from (0 for creations)
    #[serde(default)]
    pub base_version: u64,
    /// Kind-specific attributes, see [`crate::model`]
    pub fields: Value,
    /// Tombstone flag
    #[serde(default)]
    pub deleted: bool,
    /// Wall-clock time of the write on the replica that made it (epoch millis)
    pub local_timestamp: i64,
    /// Creation time (epoch millis), used for stable child ordering
    #[serde(default)]
    pub created_at: i64,
    /// Replica that created the entity
    #[serde(default)]
    pub origin: String,
    /// Replica that produced this version
    #[serde(default)]
    pub modified_by: String,
}

impl EntitySnapshot {
    /// Create the first version of a new entity with a fresh identifier.
    pub fn new(kind: EntityKind, parent: Option<ParentRef>, fields: Value, replica_id: &str) -> Self {
        let now = now_millis();
        let (parent_kind, parent_id) = match parent {
            Some(p) => (Some(p.kind), Some(p.id)),
            None => (None, None),
        };
        Self {
            kind,
            id: new_entity_id(),
            parent_id,
            parent_kind,
            version: 1,
            base_version: 0,
            fields,
            deleted: false,
            local_timestamp: now,
            created_at: now,
            origin: replica_id.to_string(),
            modified_by: replica_id.to_string(),
        }
    }

    /// Derive the next version of this entity, written by `replica_id`.
    #[must_use]
    pub fn next_version(&self, replica_id: &str) -> Self {
        let mut next = self.clone();
        next.base_version = self.version;
        next.version = self.version + 1;
        next.local_timestamp = now_millis().max(self.local_timestamp);
        next.modified_by = replica_id.to_string();
        next
    }

    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey { kind: self.kind, id: self.id.clone() }
    }

    #[must_use]
    pub fn parent(&self) -> Option<ParentRef> {
        match (&self.parent_kind, &self.parent_id) {
            (Some(kind), Some(id)) => Some(ParentRef { kind: *kind, id: id.clone() }),
            _ => None,
        }
    }

    /// SHA-256 over the replicated state (identity, parent, fields, tombstone).
    ///
    /// Version bookkeeping and timestamps are excluded: two snapshots with the
    /// same hash describe the same entity state.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::json!({
            "kind": self.kind,
            "id": self.id,
            "parent_id": self.parent_id,
            "parent_kind": self.parent_kind,
            "fields": self.fields,
            "deleted": self.deleted,
        });
        hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
    }

    /// Same version and same replicated state.
    #[must_use]
    pub fn same_state_as(&self, other: &EntitySnapshot) -> bool {
        self.version == other.version && self.content_hash() == other.content_hash()
    }
}

/// Generate a globally unique entity identifier.
#[must_use]
pub fn new_entity_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current wall-clock time in epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
