//! Public types for the sync engine.

use std::time::Duration;

use thiserror::Error;

use crate::checkpoint::Checkpoint;
use crate::config::SyncConfig;
use crate::entity::EntityKind;
use crate::protocol::RejectReason;
use crate::resilience::{CancelToken, RetryConfig};
use crate::storage::StorageError;
use crate::transport::TransportError;

/// Session state machine.
///
/// ```text
/// Idle → Pushing → AwaitingRemoteDelta → Applying → Committing → Idle
///          ╰──────────────┴──────────────┴───────────┴──→ Failed
/// ```
///
/// Use [`super::SyncEngine::state()`] to check the current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session running
    Idle,
    /// Building the push batch from the change log
    Pushing,
    /// Batch sent, waiting on the peer
    AwaitingRemoteDelta,
    /// Applying resolved snapshots and the remote delta
    Applying,
    /// Persisting checkpoints and compacting; not cancellable
    Committing,
    /// Last session failed; durable state is as it was before it started
    Failed,
}

impl SessionState {
    /// Numeric form for the state gauge.
    #[must_use]
    pub fn as_gauge(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Pushing => 1,
            Self::AwaitingRemoteDelta => 2,
            Self::Applying => 3,
            Self::Committing => 4,
            Self::Failed => 5,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Pushing => write!(f, "Pushing"),
            Self::AwaitingRemoteDelta => write!(f, "AwaitingRemoteDelta"),
            Self::Applying => write!(f, "Applying"),
            Self::Committing => write!(f, "Committing"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Per-call knobs: network timeout, retry policy and cancellation.
#[derive(Debug, Clone)]
pub struct SyncControl {
    /// Applied to each transport call
    pub timeout: Duration,
    pub retry: RetryConfig,
    pub cancel: CancelToken,
}

impl SyncControl {
    #[must_use]
    pub fn new(timeout: Duration, retry: RetryConfig) -> Self {
        Self {
            timeout,
            retry,
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.request_timeout(), config.retry_config())
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for SyncControl {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), RetryConfig::session())
    }
}

/// Non-fatal problems surfaced by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncWarning {
    /// The peer rejected a pushed entity; it is pushed again next session
    /// unless it was orphaned and is now deleted locally
    Rejected {
        kind: EntityKind,
        id: String,
        reason: RejectReason,
    },
    /// A peer snapshot's parent is missing or tombstoned locally
    Orphaned { kind: EntityKind, id: String },
}

impl std::fmt::Display for SyncWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected { kind, id, reason } => write!(f, "{}/{} rejected: {}", kind, id, reason),
            Self::Orphaned { kind, id } => write!(f, "{}/{} orphaned locally", kind, id),
        }
    }
}

/// Outcome of a successful session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Entities in the push batch
    pub pushed: usize,
    pub accepted: usize,
    /// Pushed entities answered with a resolved snapshot
    pub conflicts: usize,
    pub rejected: usize,
    /// Entities in the remote delta
    pub pulled: usize,
    /// Local merges performed while applying
    pub local_merges: usize,
    pub local_checkpoint: Checkpoint,
    pub remote_checkpoint: Checkpoint,
    /// False when a snapshot with an unknown parent held the remote checkpoint back
    pub remote_checkpoint_advanced: bool,
    /// Attempts used, including the successful one
    pub attempts: usize,
    pub warnings: Vec<SyncWarning>,
}

impl SyncReport {
    /// Nothing moved in either direction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pushed == 0 && self.pulled == 0
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("sync cancelled")]
    Cancelled,
    #[error("a sync session is already running")]
    SessionInProgress,
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: TransportError },
}

impl SyncError {
    /// Transport failures other than protocol violations are retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(e) if e.is_retryable())
    }
}
