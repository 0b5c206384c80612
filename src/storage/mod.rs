//! Storage backends for a replica.
//!
//! - [`InMemoryStore`]: dashmap-backed, for tests and ephemeral replicas
//! - [`SqlStore`]: SQLite via sqlx, durable across restarts

pub mod memory;
pub mod sql;
pub mod traits;

pub use memory::InMemoryStore;
pub use sql::SqlStore;
pub use traits::{
    blob_hash, BlobStore, ChangeLog, ChangeLogEntry, CheckpointStore, EntityStore, PendingStore, PutOutcome,
    ReplicaStore, StorageError,
};

use std::sync::Arc;

/// A store opened for one replica: the replica-facing traits and the blob
/// store share the same backend.
pub struct OpenedStore {
    pub replica: Arc<dyn ReplicaStore>,
    pub blobs: Arc<dyn BlobStore>,
}

/// Open SQLite at `database_url`, or a fresh in-memory store when None.
pub async fn open(database_url: Option<&str>) -> Result<OpenedStore, StorageError> {
    match database_url {
        Some(url) => {
            let store = Arc::new(SqlStore::new(url).await?);
            tracing::info!(url = %url, "Opened SQLite replica store");
            Ok(OpenedStore { replica: store.clone(), blobs: store })
        }
        None => {
            let store = Arc::new(InMemoryStore::new());
            tracing::info!("Opened in-memory replica store");
            Ok(OpenedStore { replica: store.clone(), blobs: store })
        }
    }
}
