use async_trait::async_trait;
use thiserror::Error;

use crate::checkpoint::{Checkpoint, SyncCheckpoints};
use crate::entity::{ChangeSource, EntityKind, EntitySnapshot};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{id}': expected hash {expected}, got {actual}")]
    Corruption {
        id: String,
        expected: String,
        actual: String,
    },
}

/// What a [`EntityStore::put`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Snapshot written and logged at `seq`
    Stored {
        previous_version: Option<u64>,
        seq: Checkpoint,
    },
    /// Stored version was already at or beyond the incoming one; nothing written
    Unchanged { stored_version: u64 },
}

impl PutOutcome {
    #[must_use]
    pub fn is_stored(&self) -> bool {
        matches!(self, PutOutcome::Stored { .. })
    }

    /// Version replaced by this put, if it replaced anything.
    #[must_use]
    pub fn previous_version(&self) -> Option<u64> {
        match self {
            PutOutcome::Stored { previous_version, .. } => *previous_version,
            PutOutcome::Unchanged { .. } => None,
        }
    }
}

/// One change-log record: the full post-mutation snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeLogEntry {
    pub seq: Checkpoint,
    pub kind: EntityKind,
    pub entity_id: String,
    pub version: u64,
    pub snapshot: EntitySnapshot,
    pub local_timestamp: i64,
    pub source: ChangeSource,
}

impl ChangeLogEntry {
    pub fn new(seq: Checkpoint, snapshot: EntitySnapshot, source: ChangeSource) -> Self {
        Self {
            seq,
            kind: snapshot.kind,
            entity_id: snapshot.id.clone(),
            version: snapshot.version,
            local_timestamp: snapshot.local_timestamp,
            snapshot,
            source,
        }
    }
}

/// Versioned entity storage.
///
/// `put` is idempotent: a version at or below the stored one is a no-op.
/// Every put that changes stored data appends a change-log entry atomically
/// with the write.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntitySnapshot>, StorageError>;

    async fn put(&self, snapshot: &EntitySnapshot, source: ChangeSource) -> Result<PutOutcome, StorageError>;

    /// Children of `parent_id` of the given kind, ordered by creation time then id.
    async fn list_children(&self, parent_id: &str, kind: EntityKind) -> Result<Vec<EntitySnapshot>, StorageError>;

    /// Every stored entity of one kind, tombstones included.
    async fn list_kind(&self, kind: EntityKind) -> Result<Vec<EntitySnapshot>, StorageError>;
}

/// Append-only record of mutations, addressed by checkpoint.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Record a snapshot without touching the entity table (used to requeue).
    async fn append(&self, snapshot: &EntitySnapshot, source: ChangeSource) -> Result<Checkpoint, StorageError>;

    /// Entries after `since`, ordered by sequence.
    async fn entries_since(&self, since: Checkpoint) -> Result<Vec<ChangeLogEntry>, StorageError>;

    /// Drop entries at or below `upto`. Returns how many were removed.
    async fn compact(&self, upto: Checkpoint) -> Result<usize, StorageError>;

    /// Highest sequence ever issued.
    async fn head(&self) -> Result<Checkpoint, StorageError>;

    /// Sequence of the newest entry for one entity, surviving compaction.
    async fn latest_seq(&self, kind: EntityKind, id: &str) -> Result<Option<Checkpoint>, StorageError>;

    /// A logged snapshot of `id` at exactly `version`, if still retained.
    async fn snapshot_at(&self, kind: EntityKind, id: &str, version: u64) -> Result<Option<EntitySnapshot>, StorageError>;
}

/// Per-peer checkpoint persistence.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_checkpoints(&self, peer_id: &str) -> Result<SyncCheckpoints, StorageError>;

    async fn save_checkpoints(&self, peer_id: &str, checkpoints: SyncCheckpoints) -> Result<(), StorageError>;
}

/// Snapshots pulled from the peer that could not be applied yet because an
/// ancestor is deleted locally. Retried on every session.
#[async_trait]
pub trait PendingStore: Send + Sync {
    /// Keep `snapshot` aside. A parked older version of the same entity is replaced.
    async fn park(&self, snapshot: &EntitySnapshot) -> Result<(), StorageError>;

    /// Parked snapshots, parents first.
    async fn parked(&self) -> Result<Vec<EntitySnapshot>, StorageError>;

    async fn unpark(&self, kind: EntityKind, id: &str) -> Result<(), StorageError>;
}

/// Content-addressed storage for photo bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes and return their SHA-256 hex digest.
    async fn put_blob(&self, data: &[u8]) -> Result<String, StorageError>;

    async fn get_blob(&self, hash: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn has_blob(&self, hash: &str) -> Result<bool, StorageError> {
        Ok(self.get_blob(hash).await?.is_some())
    }
}

/// Everything a replica needs from its backing store.
pub trait ReplicaStore: EntityStore + ChangeLog + CheckpointStore + PendingStore {}

impl<T: EntityStore + ChangeLog + CheckpointStore + PendingStore> ReplicaStore for T {}

/// SHA-256 hex digest of a blob.
#[must_use]
pub fn blob_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}
