//! # Inspection Sync
//!
//! An offline-first, conflict-aware sync engine for fire-safety inspection
//! data. Field devices edit a local replica with no connectivity; when a link
//! is available a session reconciles the device with the server without
//! losing edits on either side.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Mobile replica                         │
//! │  • Replica: create / update / soft_delete                  │
//! │  • Change log of local edits since the last checkpoint     │
//! │  • SyncEngine: one session at a time, retry + cancel       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          SyncRequest (push batch) ▼  ▲ SyncResponse (results + delta)
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Server replica                         │
//! │  • SyncServer: same acceptance rule as the client          │
//! │  • ConflictResolver: deterministic three-way merge         │
//! │  • Never compacts; any client may be behind                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Photo bytes move separately by content hash (see [`photos`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use inspection_sync::{
//!     EntityKind, LoopbackTransport, Replica, SyncConfig, SyncControl, SyncEngine, SyncServer,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server_config = SyncConfig { replica_id: "server".into(), ..Default::default() };
//!     let (server_replica, _) = Replica::open(&server_config).await.expect("open server");
//!     let server = Arc::new(SyncServer::new(Arc::new(server_replica)));
//!
//!     let config = SyncConfig {
//!         replica_id: "tablet-1".into(),
//!         database_url: Some("sqlite:tablet.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!     let (replica, _blobs) = Replica::open(&config).await.expect("open replica");
//!     let replica = Arc::new(replica);
//!
//!     replica
//!         .create(EntityKind::Assessment, None, json!({"property_name": "Riverside Depot"}))
//!         .await
//!         .expect("create");
//!
//!     let engine = SyncEngine::new(replica, Arc::new(LoopbackTransport::new(server)), &config.peer_id);
//!     let report = engine.sync(&SyncControl::from_config(&config)).await.expect("sync");
//!     println!("pushed {} pulled {}", report.pushed, report.pulled);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`entity`] / [`model`]: snapshots, kinds and typed attributes
//! - [`storage`]: entity store, change log, checkpoints and blobs (memory, SQLite)
//! - [`replica`]: local edits and the acceptance rule
//! - [`resolver`]: deterministic conflict merge
//! - [`engine`]: client session state machine
//! - [`server`]: server-side request handling
//! - [`transport`] / [`protocol`]: transport boundary and wire messages
//! - [`photos`]: out-of-band blob transfer
//! - [`resilience`]: retry with backoff, cancellation

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod entity;
pub mod metrics;
pub mod model;
pub mod photos;
pub mod protocol;
pub mod replica;
pub mod resilience;
pub mod resolver;
pub mod server;
pub mod storage;
pub mod transport;

pub use checkpoint::{Checkpoint, SyncCheckpoints};
pub use config::SyncConfig;
pub use engine::{SessionState, SyncControl, SyncEngine, SyncError, SyncReport, SyncWarning};
pub use entity::{ChangeSource, EntityKey, EntityKind, EntitySnapshot, ParentRef};
pub use model::{
    AssessmentFields, AssessmentStatus, EntityFields, FireSafetyItemFields, FloorFields, InspectionStatus,
    ItemStatus, PhotoFields, RoomFields,
};
pub use photos::{BlobSync, BlobSyncReport, BlobTransport, LoopbackBlobTransport};
pub use protocol::{EntityResult, Outcome, RejectReason, SyncRequest, SyncResponse};
pub use replica::{ApplyOutcome, ApplyResult, Replica, ReplicaError};
pub use resilience::{CancelToken, RetryConfig};
pub use resolver::{CommonAncestor, ConflictResolver};
pub use server::SyncServer;
pub use storage::{
    blob_hash, BlobStore, ChangeLog, ChangeLogEntry, CheckpointStore, EntityStore, InMemoryStore, PendingStore,
    PutOutcome, ReplicaStore, SqlStore, StorageError,
};
pub use transport::{LoopbackTransport, SyncTransport, TransportError};
pub use metrics::LatencyTimer;
