// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server side of a sync session.
//!
//! [`SyncServer::handle`] applies a client's push batch with the same
//! acceptance rule the client uses, then answers with per-entity results and
//! everything that changed on the server since the client's remote
//! checkpoint. Entities whose latest version is exactly the one reported in
//! the results are left out of the delta so the client never gets its own
//! writes echoed back.
//!
//! The server never compacts its change log: any client may still be behind.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::entity::{EntityKey, EntitySnapshot};
use crate::metrics;
use crate::protocol::{SyncRequest, SyncResponse};
use crate::replica::Replica;
use crate::storage::{ChangeLog, ChangeLogEntry, StorageError};

pub struct SyncServer {
    replica: Arc<Replica>,
}

impl SyncServer {
    pub fn new(replica: Arc<Replica>) -> Self {
        Self { replica }
    }

    #[must_use]
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    #[instrument(skip(self, request), fields(
        server = %self.replica.id(),
        client = %request.replica_id,
        entities = request.entities.len(),
        since = %request.remote_checkpoint_known_to_client
    ))]
    pub async fn handle(&self, request: SyncRequest) -> Result<SyncResponse, StorageError> {
        let horizon = request.remote_checkpoint_known_to_client;
        let applied = self.replica.apply_batch(&request.entities, horizon).await?;

        let reported: HashMap<EntityKey, u64> = applied
            .iter()
            .filter_map(|r| r.final_version().map(|v| (r.key(), v)))
            .collect();

        let entries = self.replica.store().entries_since(horizon).await?;
        let new_remote_checkpoint = entries.last().map(|e| e.seq).unwrap_or(horizon);
        let remote_delta = outbound_delta(entries, &reported);

        let results: Vec<_> = applied.into_iter().map(|r| r.into_entity_result()).collect();
        metrics::record_entities("push", request.entities.len());
        metrics::record_entities("pull", remote_delta.len());
        info!(
            results = results.len(),
            delta = remote_delta.len(),
            checkpoint = %new_remote_checkpoint,
            "Handled sync request"
        );

        Ok(SyncResponse {
            results,
            remote_delta,
            new_remote_checkpoint,
        })
    }
}

/// Newest snapshot per entity, parents first, minus what the results already carry.
fn outbound_delta(entries: Vec<ChangeLogEntry>, reported: &HashMap<EntityKey, u64>) -> Vec<EntitySnapshot> {
    let mut latest: HashMap<EntityKey, ChangeLogEntry> = HashMap::new();
    for entry in entries {
        let key = entry.snapshot.key();
        match latest.get(&key) {
            Some(current) if (current.version, current.seq) >= (entry.version, entry.seq) => {}
            _ => {
                latest.insert(key, entry);
            }
        }
    }

    let mut delta: Vec<ChangeLogEntry> = latest
        .into_iter()
        .filter(|(key, entry)| {
            let echo = reported.get(key) == Some(&entry.version);
            if echo {
                debug!(entity = %key, version = entry.version, "Suppressing echo from delta");
            }
            !echo
        })
        .map(|(_, entry)| entry)
        .collect();
    delta.sort_by_key(|e| (e.kind.depth(), e.seq));
    delta.into_iter().map(|e| e.snapshot).collect()
}
