use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::traits::{
    blob_hash, BlobStore, ChangeLog, ChangeLogEntry, CheckpointStore, EntityStore, PendingStore, PutOutcome,
    StorageError,
};
use crate::checkpoint::{Checkpoint, SyncCheckpoints};
use crate::entity::{ChangeSource, EntityKey, EntityKind, EntitySnapshot};

type ChildKey = (String, EntityKind);

/// Volatile replica store.
///
/// Reads go straight to the maps; every mutation goes through one lock so a
/// put and its change-log entry land together.
pub struct InMemoryStore {
    entities: DashMap<EntityKey, EntitySnapshot>,
    children: DashMap<ChildKey, BTreeSet<(i64, String)>>,
    log: RwLock<BTreeMap<u64, ChangeLogEntry>>,
    latest: DashMap<EntityKey, Checkpoint>,
    checkpoints: DashMap<String, SyncCheckpoints>,
    parked: DashMap<EntityKey, EntitySnapshot>,
    blobs: DashMap<String, Vec<u8>>,
    /// Single mutation path; guards `head`
    write_lock: Mutex<u64>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
            children: DashMap::new(),
            log: RwLock::new(BTreeMap::new()),
            latest: DashMap::new(),
            checkpoints: DashMap::new(),
            parked: DashMap::new(),
            blobs: DashMap::new(),
            write_lock: Mutex::new(0),
        }
    }

    /// Number of stored entities (tombstones included)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entries currently retained in the change log
    #[must_use]
    pub fn log_len(&self) -> usize {
        self.log.read().len()
    }

    fn append_locked(&self, head: &mut u64, snapshot: &EntitySnapshot, source: ChangeSource) -> Checkpoint {
        *head += 1;
        let seq = Checkpoint::from_seq(*head);
        self.log.write().insert(*head, ChangeLogEntry::new(seq, snapshot.clone(), source));
        self.latest.insert(snapshot.key(), seq);
        seq
    }

    fn unindex(&self, snapshot: &EntitySnapshot) {
        if let Some(parent_id) = &snapshot.parent_id {
            if let Some(mut set) = self.children.get_mut(&(parent_id.clone(), snapshot.kind)) {
                set.remove(&(snapshot.created_at, snapshot.id.clone()));
            }
        }
    }

    fn index(&self, snapshot: &EntitySnapshot) {
        if let Some(parent_id) = &snapshot.parent_id {
            self.children
                .entry((parent_id.clone(), snapshot.kind))
                .or_default()
                .insert((snapshot.created_at, snapshot.id.clone()));
        }
    }

    fn put_sync(&self, snapshot: &EntitySnapshot, source: ChangeSource) -> PutOutcome {
        let mut head = self.write_lock.lock();
        let key = snapshot.key();
        let previous = self.entities.get(&key).map(|s| s.value().clone());

        if let Some(prev) = &previous {
            if prev.version >= snapshot.version {
                return PutOutcome::Unchanged { stored_version: prev.version };
            }
            self.unindex(prev);
        }

        let seq = self.append_locked(&mut head, snapshot, source);
        self.index(snapshot);
        self.entities.insert(key, snapshot.clone());

        PutOutcome::Stored {
            previous_version: previous.map(|p| p.version),
            seq,
        }
    }

    fn append_sync(&self, snapshot: &EntitySnapshot, source: ChangeSource) -> Checkpoint {
        let mut head = self.write_lock.lock();
        self.append_locked(&mut head, snapshot, source)
    }

    fn compact_sync(&self, upto: Checkpoint) -> usize {
        let _head = self.write_lock.lock();
        let mut log = self.log.write();
        let keep = log.split_off(&upto.seq().saturating_add(1));
        let removed = log.len();
        *log = keep;
        removed
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntitySnapshot>, StorageError> {
        let key = EntityKey { kind, id: id.to_string() };
        Ok(self.entities.get(&key).map(|r| r.value().clone()))
    }

    async fn put(&self, snapshot: &EntitySnapshot, source: ChangeSource) -> Result<PutOutcome, StorageError> {
        Ok(self.put_sync(snapshot, source))
    }

    async fn list_children(&self, parent_id: &str, kind: EntityKind) -> Result<Vec<EntitySnapshot>, StorageError> {
        let ids: Vec<String> = match self.children.get(&(parent_id.to_string(), kind)) {
            Some(set) => set.iter().map(|(_, id)| id.clone()).collect(),
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .into_iter()
            .filter_map(|id| self.entities.get(&EntityKey { kind, id }).map(|r| r.value().clone()))
            .collect())
    }

    async fn list_kind(&self, kind: EntityKind) -> Result<Vec<EntitySnapshot>, StorageError> {
        let mut out: Vec<EntitySnapshot> = self
            .entities
            .iter()
            .filter(|r| r.key().kind == kind)
            .map(|r| r.value().clone())
            .collect();
        out.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(out)
    }
}

#[async_trait]
impl ChangeLog for InMemoryStore {
    async fn append(&self, snapshot: &EntitySnapshot, source: ChangeSource) -> Result<Checkpoint, StorageError> {
        Ok(self.append_sync(snapshot, source))
    }

    async fn entries_since(&self, since: Checkpoint) -> Result<Vec<ChangeLogEntry>, StorageError> {
        let log = self.log.read();
        Ok(log.range(since.seq().saturating_add(1)..).map(|(_, e)| e.clone()).collect())
    }

    async fn compact(&self, upto: Checkpoint) -> Result<usize, StorageError> {
        Ok(self.compact_sync(upto))
    }

    async fn head(&self) -> Result<Checkpoint, StorageError> {
        Ok(Checkpoint::from_seq(*self.write_lock.lock()))
    }

    async fn latest_seq(&self, kind: EntityKind, id: &str) -> Result<Option<Checkpoint>, StorageError> {
        let key = EntityKey { kind, id: id.to_string() };
        Ok(self.latest.get(&key).map(|r| *r.value()))
    }

    async fn snapshot_at(&self, kind: EntityKind, id: &str, version: u64) -> Result<Option<EntitySnapshot>, StorageError> {
        let log = self.log.read();
        Ok(log
            .values()
            .rev()
            .find(|e| e.kind == kind && e.entity_id == id && e.version == version)
            .map(|e| e.snapshot.clone()))
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn load_checkpoints(&self, peer_id: &str) -> Result<SyncCheckpoints, StorageError> {
        Ok(self.checkpoints.get(peer_id).map(|r| *r.value()).unwrap_or_default())
    }

    async fn save_checkpoints(&self, peer_id: &str, checkpoints: SyncCheckpoints) -> Result<(), StorageError> {
        self.checkpoints.insert(peer_id.to_string(), checkpoints);
        Ok(())
    }
}

#[async_trait]
impl PendingStore for InMemoryStore {
    async fn park(&self, snapshot: &EntitySnapshot) -> Result<(), StorageError> {
        let mut slot = self.parked.entry(snapshot.key()).or_insert_with(|| snapshot.clone());
        if slot.version < snapshot.version {
            *slot = snapshot.clone();
        }
        Ok(())
    }

    async fn parked(&self) -> Result<Vec<EntitySnapshot>, StorageError> {
        let mut all: Vec<EntitySnapshot> = self.parked.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|s| (s.kind.depth(), s.created_at, s.id.clone()));
        Ok(all)
    }

    async fn unpark(&self, kind: EntityKind, id: &str) -> Result<(), StorageError> {
        self.parked.remove(&EntityKey { kind, id: id.to_string() });
        Ok(())
    }
}

#[async_trait]
impl BlobStore for InMemoryStore {
    async fn put_blob(&self, data: &[u8]) -> Result<String, StorageError> {
        let hash = blob_hash(data);
        self.blobs.entry(hash.clone()).or_insert_with(|| data.to_vec());
        Ok(hash)
    }

    async fn get_blob(&self, hash: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs.get(hash).map(|r| r.value().clone()))
    }

    async fn has_blob(&self, hash: &str) -> Result<bool, StorageError> {
        Ok(self.blobs.contains_key(hash))
    }
}
