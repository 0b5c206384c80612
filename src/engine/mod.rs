// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client-side sync engine.
//!
//! The [`SyncEngine`] owns one replica's sessions with one peer. Each session
//! pushes the replica's unacknowledged local changes, adopts whatever the peer
//! resolved, applies the peer's delta and only then moves both checkpoints.
//!
//! # Lifecycle
//!
//! ```text
//! Idle → Pushing → AwaitingRemoteDelta → Applying → Committing → Idle
//! ```
//!
//! Any failure before `Committing` ends the session in `Failed` with the
//! checkpoints untouched; [`SyncEngine::sync`] retries transient transport
//! failures from `Idle` with jittered backoff.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use inspection_sync::{
//!     InMemoryStore, LoopbackTransport, Replica, SessionState, SyncControl, SyncEngine, SyncServer,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let server = Arc::new(SyncServer::new(Arc::new(Replica::new("server", Arc::new(InMemoryStore::new()), "server"))));
//! let client = Arc::new(Replica::new("tablet-1", Arc::new(InMemoryStore::new()), "server"));
//! let engine = SyncEngine::new(client, Arc::new(LoopbackTransport::new(server)), "server");
//!
//! assert_eq!(engine.state(), SessionState::Idle);
//! let report = engine.sync(&SyncControl::default()).await.expect("sync failed");
//! assert!(report.is_empty());
//! # }
//! ```

mod session;
mod types;

pub use types::{SessionState, SyncControl, SyncError, SyncReport, SyncWarning};

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::checkpoint::SyncCheckpoints;
use crate::entity::ChangeSource;
use crate::metrics;
use crate::replica::Replica;
use crate::storage::{ChangeLog, CheckpointStore, StorageError};
use crate::transport::SyncTransport;

use session::SyncSession;

pub struct SyncEngine {
    replica: Arc<Replica>,
    transport: Arc<dyn SyncTransport>,
    peer_id: String,

    /// Session state (broadcast to watchers)
    state: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,

    /// At most one session per engine
    session_lock: Mutex<()>,
}

impl SyncEngine {
    pub fn new(replica: Arc<Replica>, transport: Arc<dyn SyncTransport>, peer_id: impl Into<String>) -> Self {
        let (state, state_rx) = watch::channel(SessionState::Idle);
        Self {
            replica,
            transport,
            peer_id: peer_id.into(),
            state,
            state_rx,
            session_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Checkpoints committed by the last successful session with this peer.
    pub async fn checkpoints(&self) -> Result<SyncCheckpoints, StorageError> {
        self.replica.store().load_checkpoints(&self.peer_id).await
    }

    /// Local changes the peer has not acknowledged yet.
    pub async fn pending_changes(&self) -> Result<usize, StorageError> {
        let since = self.checkpoints().await?.local;
        let entries = self.replica.store().entries_since(since).await?;
        Ok(entries.iter().filter(|e| e.source == ChangeSource::Local).count())
    }

    /// Run a single session without retrying.
    #[tracing::instrument(skip(self, control), fields(replica = %self.replica.id(), peer = %self.peer_id))]
    pub async fn sync_once(&self, control: &SyncControl) -> Result<SyncReport, SyncError> {
        let _guard = self.session_lock.try_lock().map_err(|_| SyncError::SessionInProgress)?;
        let mut report = self.run_session(control).await?;
        report.attempts = 1;
        Ok(report)
    }

    /// Run a session, retrying transient transport failures per `control.retry`.
    ///
    /// Protocol errors, storage errors and cancellation are returned as-is.
    #[tracing::instrument(skip(self, control), fields(replica = %self.replica.id(), peer = %self.peer_id))]
    pub async fn sync(&self, control: &SyncControl) -> Result<SyncReport, SyncError> {
        let _guard = self.session_lock.try_lock().map_err(|_| SyncError::SessionInProgress)?;
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.run_session(control).await {
                Ok(mut report) => {
                    report.attempts = attempts;
                    return Ok(report);
                }
                Err(SyncError::Transport(e)) if e.is_retryable() => {
                    if control.retry.max_retries.is_some_and(|max| attempts >= max) {
                        warn!(attempts, error = %e, "Sync retries exhausted");
                        return Err(SyncError::RetriesExhausted { attempts, last: e });
                    }
                    let delay = control.retry.delay_for(attempts);
                    warn!(attempt = attempts, error = %e, retry_in = ?delay, "Sync attempt failed, retrying");
                    metrics::record_retry(self.replica.id());
                    tokio::select! {
                        biased;
                        _ = control.cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_session(&self, control: &SyncControl) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let session = SyncSession::new(&self.replica, self.transport.as_ref(), &self.peer_id, control, &self.state);
        let result = session.run().await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(SyncError::Cancelled) => "cancelled",
            Err(_) => "failed",
        };
        metrics::record_session(self.replica.id(), outcome);
        metrics::record_session_duration(self.replica.id(), started.elapsed());
        if let Ok(report) = &result {
            info!(warnings = report.warnings.len(), elapsed = ?started.elapsed(), "Sync session finished");
        }
        result
    }
}
