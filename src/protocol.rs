//! Wire messages exchanged during a sync session.
//!
//! All messages serialize to camelCase JSON. Checkpoints are bare numbers
//! that only the replica which minted them interprets.
//!
//! ```
//! use inspection_sync::protocol::{EntityResult, Outcome, RejectReason};
//! use inspection_sync::EntityKind;
//!
//! let result = EntityResult {
//!     id: "f-1".into(),
//!     kind: EntityKind::Floor,
//!     outcome: Outcome::Rejected { reason: RejectReason::OrphanedEntity },
//!     resolved_snapshot: None,
//! };
//! let wire = serde_json::to_value(&result).unwrap();
//! assert_eq!(wire["outcome"]["rejected"]["reason"]["code"], "orphaned_entity");
//! ```

use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::entity::{EntityKey, EntityKind, EntitySnapshot};

/// Push batch plus the client's view of sync progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Pushing replica
    pub replica_id: String,
    /// Client change-log position the batch starts after
    pub since_checkpoint: Checkpoint,
    /// Last server position the client has fully applied
    pub remote_checkpoint_known_to_client: Checkpoint,
    /// Newest snapshot per changed entity, parents before children
    pub entities: Vec<EntitySnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// One result per pushed entity
    pub results: Vec<EntityResult>,
    /// Server changes since the client's remote checkpoint
    pub remote_delta: Vec<EntitySnapshot>,
    pub new_remote_checkpoint: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityResult {
    pub id: String,
    pub kind: EntityKind,
    pub outcome: Outcome,
    /// Present exactly when `outcome` is `ConflictResolved`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_snapshot: Option<EntitySnapshot>,
}

impl EntityResult {
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey { kind: self.kind, id: self.id.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    /// The peer must adopt the attached snapshot
    ConflictResolved,
    Rejected { reason: RejectReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("parent could not be resolved")]
    OrphanedEntity,
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
}

impl RejectReason {
    /// Short label for metrics.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::OrphanedEntity => "orphaned_entity",
            RejectReason::SchemaMismatch(_) => "schema_mismatch",
        }
    }
}
