// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One push/pull exchange with the peer.
//!
//! A [`SyncSession`] walks the state machine exactly once. Nothing durable
//! changes before `Committing` except idempotent entity puts, so a session
//! that fails or is cancelled earlier leaves both checkpoints and the change
//! log where they were and the next session resends the same batch.
//!
//! The exchange with the peer is bounded by [`SyncControl::timeout`]; a peer
//! that never answers fails the session with [`TransportError::Timeout`].

use std::collections::{HashMap, HashSet};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, SyncCheckpoints};
use crate::entity::{ChangeSource, EntityKey, EntitySnapshot};
use crate::metrics::{self, LatencyTimer};
use crate::protocol::{Outcome, RejectReason, SyncRequest, SyncResponse};
use crate::replica::{ApplyOutcome, ApplyResult, Replica};
use crate::storage::{ChangeLog, ChangeLogEntry, CheckpointStore, EntityStore, PendingStore};
use crate::transport::{SyncTransport, TransportError};

use super::types::{SessionState, SyncControl, SyncError, SyncReport, SyncWarning};

pub(super) struct SyncSession<'a> {
    replica: &'a Replica,
    transport: &'a dyn SyncTransport,
    peer_id: &'a str,
    control: &'a SyncControl,
    state_tx: &'a watch::Sender<SessionState>,
    state: SessionState,
}

impl<'a> SyncSession<'a> {
    pub(super) fn new(
        replica: &'a Replica,
        transport: &'a dyn SyncTransport,
        peer_id: &'a str,
        control: &'a SyncControl,
        state_tx: &'a watch::Sender<SessionState>,
    ) -> Self {
        Self {
            replica,
            transport,
            peer_id,
            control,
            state_tx,
            state: SessionState::Idle,
        }
    }

    /// Run to completion. Ends in `Idle` on success and `Failed` otherwise.
    pub(super) async fn run(mut self) -> Result<SyncReport, SyncError> {
        let result = self.execute().await;
        match &result {
            Ok(_) => self.transition(SessionState::Idle),
            Err(e) => {
                warn!(peer = %self.peer_id, failed_in = %self.state, error = %e, "Sync session failed");
                self.transition(SessionState::Failed);
            }
        }
        result
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = %self.state, to = %next, "Session state change");
        self.state = next;
        self.state_tx.send_replace(next);
        metrics::set_session_state(self.replica.id(), next.as_gauge());
    }

    fn ensure_not_cancelled(&self) -> Result<(), SyncError> {
        if self.control.cancel.is_cancelled() {
            info!(peer = %self.peer_id, at = %self.state, "Sync session cancelled");
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    async fn execute(&mut self) -> Result<SyncReport, SyncError> {
        let replica: &'a Replica = self.replica;
        let store = replica.store();

        // ========== Pushing ==========
        self.ensure_not_cancelled()?;
        self.transition(SessionState::Pushing);
        let checkpoints = store.load_checkpoints(self.peer_id).await?;
        let (entities, high_water) = {
            let _timer = LatencyTimer::new("push");
            let entries = store.entries_since(checkpoints.local).await?;
            build_push_batch(entries, checkpoints.local)
        };
        let request = SyncRequest {
            replica_id: self.replica.id().to_string(),
            since_checkpoint: checkpoints.local,
            remote_checkpoint_known_to_client: checkpoints.remote,
            entities,
        };
        debug!(
            pushing = request.entities.len(),
            since = %checkpoints.local,
            high_water = %high_water,
            "Built push batch"
        );

        // ========== AwaitingRemoteDelta ==========
        self.ensure_not_cancelled()?;
        self.transition(SessionState::AwaitingRemoteDelta);
        let response = {
            let _timer = LatencyTimer::new("exchange");
            let exchange = tokio::time::timeout(self.control.timeout, self.transport.send(&request, self.control.timeout));
            tokio::select! {
                biased;
                _ = self.control.cancel.cancelled() => return Err(SyncError::Cancelled),
                sent = exchange => match sent {
                    Ok(sent) => sent?,
                    Err(_) => {
                        warn!(peer = %self.peer_id, timeout_ms = self.control.timeout.as_millis() as u64, "Peer did not answer in time");
                        return Err(TransportError::Timeout(self.control.timeout).into());
                    }
                },
            }
        };
        verify_response(&request.entities, &response)?;

        // ========== Applying ==========
        self.ensure_not_cancelled()?;
        self.transition(SessionState::Applying);
        let mut report = SyncReport {
            pushed: request.entities.len(),
            pulled: response.remote_delta.len(),
            ..Default::default()
        };

        let mut requeue = Vec::new();
        let mut resolved = Vec::new();
        for result in &response.results {
            match &result.outcome {
                Outcome::Accepted => report.accepted += 1,
                Outcome::ConflictResolved => {
                    report.conflicts += 1;
                    resolved.extend(result.resolved_snapshot.iter().cloned());
                }
                Outcome::Rejected { reason } => {
                    report.rejected += 1;
                    warn!(kind = %result.kind, id = %result.id, %reason, "Peer rejected entity");
                    metrics::record_rejection(result.kind, reason.code());
                    report.warnings.push(SyncWarning::Rejected {
                        kind: result.kind,
                        id: result.id.clone(),
                        reason: reason.clone(),
                    });
                    requeue.push(result.key());
                }
            }
        }

        let applied = {
            let _timer = LatencyTimer::new("apply");
            let mut applied = replica.apply_batch(&resolved, high_water).await?;
            applied.extend(replica.apply_batch(&response.remote_delta, high_water).await?);
            applied
        };
        summarize_applied(&applied, &mut report);

        // Parked snapshots from earlier sessions get another chance now that
        // this delta may have brought their ancestors back.
        let waiting = store.parked().await?;
        let mut unpark = Vec::new();
        if !waiting.is_empty() {
            let retried = replica.apply_batch(&waiting, high_water).await?;
            for (snapshot, result) in waiting.iter().zip(&retried) {
                if !result.is_orphaned() {
                    debug!(kind = %snapshot.kind, id = %snapshot.id, "Applied parked snapshot");
                    unpark.push(snapshot.key());
                }
            }
        }

        // A parent missing outright may still arrive, so the delta is pulled
        // again. One under a local tombstone is parked until the tombstone
        // loses to a later live edit.
        let mut hold_remote = false;
        let mut park = Vec::new();
        for (snapshot, result) in resolved.iter().chain(&response.remote_delta).zip(&applied) {
            if !result.is_orphaned() {
                continue;
            }
            if let Some(parent) = snapshot.parent() {
                if store.get(parent.kind, &parent.id).await?.is_none() {
                    hold_remote = true;
                } else {
                    park.push(snapshot);
                }
            }
        }

        // ========== Committing ==========
        self.ensure_not_cancelled()?;
        self.transition(SessionState::Committing);
        let _timer = LatencyTimer::new("commit");

        // Requeued entries land above high_water and survive the compaction below.
        for key in &requeue {
            if let Some(current) = store.get(key.kind, &key.id).await? {
                store.append(&current, ChangeSource::Local).await?;
            }
        }
        for key in &unpark {
            store.unpark(key.kind, &key.id).await?;
        }
        for snapshot in park {
            store.park(snapshot).await?;
        }

        let remote = if hold_remote {
            warn!(held_at = %checkpoints.remote, offered = %response.new_remote_checkpoint, "Holding remote checkpoint back, delta references unknown parents");
            checkpoints.remote
        } else {
            response.new_remote_checkpoint
        };
        let committed = SyncCheckpoints { local: high_water, remote };
        store.save_checkpoints(self.peer_id, committed).await?;

        match store.compact(high_water).await {
            Ok(removed) => debug!(removed, upto = %high_water, "Compacted change log"),
            Err(e) => warn!(error = %e, upto = %high_water, "Change log compaction failed, retrying next session"),
        }

        metrics::record_entities("push", report.pushed);
        metrics::record_entities("pull", report.pulled);
        report.local_checkpoint = committed.local;
        report.remote_checkpoint = committed.remote;
        report.remote_checkpoint_advanced = !hold_remote;
        info!(
            peer = %self.peer_id,
            pushed = report.pushed,
            accepted = report.accepted,
            conflicts = report.conflicts,
            rejected = report.rejected,
            pulled = report.pulled,
            local = %committed.local,
            remote = %committed.remote,
            "Sync session committed"
        );
        Ok(report)
    }
}

/// Newest local snapshot per entity, parents first, and the highest sequence read.
///
/// Replicated entries are skipped but still advance the high-water mark.
pub(super) fn build_push_batch(entries: Vec<ChangeLogEntry>, since: Checkpoint) -> (Vec<EntitySnapshot>, Checkpoint) {
    let high_water = entries.last().map(|e| e.seq).unwrap_or(since);

    let mut latest: HashMap<EntityKey, ChangeLogEntry> = HashMap::new();
    for entry in entries.into_iter().filter(|e| e.source == ChangeSource::Local) {
        let key = entry.snapshot.key();
        match latest.get(&key) {
            Some(current) if (current.version, current.seq) >= (entry.version, entry.seq) => {}
            _ => {
                latest.insert(key, entry);
            }
        }
    }

    let mut batch: Vec<ChangeLogEntry> = latest.into_values().collect();
    batch.sort_by_key(|e| (e.kind.depth(), e.seq));
    (batch.into_iter().map(|e| e.snapshot).collect(), high_water)
}

/// Every pushed entity must come back exactly once, and resolved results
/// must carry the snapshot to adopt.
pub(super) fn verify_response(pushed: &[EntitySnapshot], response: &SyncResponse) -> Result<(), TransportError> {
    let expected: HashSet<EntityKey> = pushed.iter().map(EntitySnapshot::key).collect();
    let mut seen = HashSet::with_capacity(expected.len());

    for result in &response.results {
        let key = result.key();
        if !expected.contains(&key) {
            return Err(TransportError::Protocol(format!("result for {} which was not pushed", key)));
        }
        if !seen.insert(key.clone()) {
            return Err(TransportError::Protocol(format!("duplicate result for {}", key)));
        }
        match (&result.outcome, &result.resolved_snapshot) {
            (Outcome::ConflictResolved, None) => {
                return Err(TransportError::Protocol(format!("resolved result for {} has no snapshot", key)));
            }
            (Outcome::ConflictResolved, Some(snapshot)) if snapshot.key() != key => {
                return Err(TransportError::Protocol(format!(
                    "resolved snapshot {} attached to result for {}",
                    snapshot.key(),
                    key
                )));
            }
            (Outcome::Accepted | Outcome::Rejected { .. }, Some(_)) => {
                return Err(TransportError::Protocol(format!("unexpected snapshot on result for {}", key)));
            }
            _ => {}
        }
    }

    if seen.len() != expected.len() {
        let missing = expected.len() - seen.len();
        return Err(TransportError::Protocol(format!("{} pushed entities have no result", missing)));
    }
    Ok(())
}

/// Fold local apply results into the report.
fn summarize_applied(applied: &[ApplyResult], report: &mut SyncReport) {
    for result in applied {
        match &result.outcome {
            ApplyOutcome::Resolved { merged: true, .. } => report.local_merges += 1,
            ApplyOutcome::Rejected(RejectReason::OrphanedEntity) => {
                report.warnings.push(SyncWarning::Orphaned {
                    kind: result.kind,
                    id: result.id.clone(),
                });
            }
            ApplyOutcome::Rejected(reason) => {
                warn!(kind = %result.kind, id = %result.id, %reason, "Dropped invalid snapshot from peer");
                report.warnings.push(SyncWarning::Rejected {
                    kind: result.kind,
                    id: result.id.clone(),
                    reason: reason.clone(),
                });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityKind, ParentRef};
    use crate::protocol::EntityResult;
    use serde_json::json;

    fn assessment() -> EntitySnapshot {
        EntitySnapshot::new(EntityKind::Assessment, None, json!({"property_name": "HQ"}), "mobile")
    }

    fn floor(parent: &EntitySnapshot) -> EntitySnapshot {
        EntitySnapshot::new(
            EntityKind::Floor,
            Some(ParentRef::new(EntityKind::Assessment, parent.id.clone())),
            json!({}),
            "mobile",
        )
    }

    fn entry(seq: u64, snapshot: &EntitySnapshot, source: ChangeSource) -> ChangeLogEntry {
        ChangeLogEntry::new(Checkpoint::from_seq(seq), snapshot.clone(), source)
    }

    fn result(snapshot: &EntitySnapshot, outcome: Outcome, resolved: Option<EntitySnapshot>) -> EntityResult {
        EntityResult {
            id: snapshot.id.clone(),
            kind: snapshot.kind,
            outcome,
            resolved_snapshot: resolved,
        }
    }

    fn response(results: Vec<EntityResult>) -> SyncResponse {
        SyncResponse {
            results,
            remote_delta: vec![],
            new_remote_checkpoint: Checkpoint::ZERO,
        }
    }

    #[test]
    fn test_push_batch_latest_per_entity_parents_first() {
        let a = assessment();
        let f = floor(&a);
        let a2 = a.next_version("mobile");
        let replicated = assessment();

        let entries = vec![
            entry(3, &f, ChangeSource::Local),
            entry(4, &a, ChangeSource::Local),
            entry(5, &a2, ChangeSource::Local),
            entry(6, &replicated, ChangeSource::Replicated),
        ];
        let (batch, high_water) = build_push_batch(entries, Checkpoint::from_seq(2));

        assert_eq!(batch, vec![a2, f]);
        assert_eq!(high_water, Checkpoint::from_seq(6));
    }

    #[test]
    fn test_push_batch_empty_keeps_checkpoint() {
        let (batch, high_water) = build_push_batch(vec![], Checkpoint::from_seq(9));
        assert!(batch.is_empty());
        assert_eq!(high_water, Checkpoint::from_seq(9));
    }

    #[test]
    fn test_verify_accepts_complete_response() {
        let a = assessment();
        let f = floor(&a);
        let merged = f.next_version("server");
        let resp = response(vec![
            result(&a, Outcome::Accepted, None),
            result(&f, Outcome::ConflictResolved, Some(merged)),
        ]);
        assert!(verify_response(&[a, f], &resp).is_ok());
    }

    #[test]
    fn test_verify_missing_result() {
        let a = assessment();
        let f = floor(&a);
        let resp = response(vec![result(&a, Outcome::Accepted, None)]);
        assert!(matches!(verify_response(&[a, f], &resp), Err(TransportError::Protocol(_))));
    }

    #[test]
    fn test_verify_resolved_without_snapshot() {
        let a = assessment();
        let resp = response(vec![result(&a, Outcome::ConflictResolved, None)]);
        assert!(matches!(verify_response(&[a], &resp), Err(TransportError::Protocol(_))));
    }

    #[test]
    fn test_verify_unknown_and_duplicate_results() {
        let a = assessment();
        let other = assessment();
        let unknown = response(vec![result(&other, Outcome::Accepted, None)]);
        assert!(verify_response(&[a.clone()], &unknown).is_err());

        let duplicate = response(vec![result(&a, Outcome::Accepted, None), result(&a, Outcome::Accepted, None)]);
        assert!(verify_response(&[a], &duplicate).is_err());
    }

    #[test]
    fn test_summarize_reports_orphans() {
        let mut report = SyncReport::default();
        let applied = vec![
            ApplyResult {
                kind: EntityKind::Room,
                id: "r-1".into(),
                outcome: ApplyOutcome::Rejected(RejectReason::OrphanedEntity),
            },
            ApplyResult {
                kind: EntityKind::Floor,
                id: "f-1".into(),
                outcome: ApplyOutcome::Accepted { version: 2 },
            },
        ];
        summarize_applied(&applied, &mut report);
        assert_eq!(report.warnings, vec![SyncWarning::Orphaned { kind: EntityKind::Room, id: "r-1".into() }]);
    }
}
