//! Opaque checkpoint tokens.
//!
//! A [`Checkpoint`] marks sync progress between two replicas. Stores mint
//! them from their change-log sequence; the engine only ever compares them
//! for equality and ordering.

use serde::{Deserialize, Serialize};

/// Monotonic, opaque sync progress marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(u64);

impl Checkpoint {
    /// The checkpoint before any change was ever recorded.
    pub const ZERO: Checkpoint = Checkpoint(0);

    /// Mint a checkpoint from a store sequence number.
    #[must_use]
    pub const fn from_seq(seq: u64) -> Self {
        Self(seq)
    }

    /// Underlying sequence number. Only storage backends should need this.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cp:{}", self.0)
    }
}

/// The pair of checkpoints a replica persists per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCheckpoints {
    /// Last local change-log position acknowledged by the peer
    pub local: Checkpoint,
    /// Last peer position this replica has fully applied
    pub remote: Checkpoint,
}
