//! Out-of-band photo blob transfer.
//!
//! Photo snapshots carry only a `content_hash`; the image bytes move
//! separately, addressed by that hash. [`BlobSync::run`] compares the hashes
//! referenced by live local photos against both blob stores and copies
//! whatever is missing in either direction. Every hash is retried on its own,
//! so one bad upload does not hold back the rest of the pass.
//!
//! Downloaded bytes are rehashed before they are stored. A mismatch is
//! reported as [`StorageError::Corruption`] and the blob is not kept.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::entity::EntityKind;
use crate::metrics;
use crate::model::{EntityFields, PhotoFields};
use crate::replica::Replica;
use crate::resilience::{retry, RetryConfig};
use crate::storage::{blob_hash, BlobStore, EntityStore, StorageError};
use crate::transport::TransportError;

#[async_trait]
pub trait BlobTransport: Send + Sync {
    async fn has_remote(&self, hash: &str) -> Result<bool, TransportError>;

    async fn upload(&self, hash: &str, data: &[u8]) -> Result<(), TransportError>;

    async fn download(&self, hash: &str) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Blob transport backed directly by the peer's [`BlobStore`].
pub struct LoopbackBlobTransport {
    remote: Arc<dyn BlobStore>,
}

impl LoopbackBlobTransport {
    pub fn new(remote: Arc<dyn BlobStore>) -> Self {
        Self { remote }
    }
}

fn unavailable(e: StorageError) -> TransportError {
    TransportError::Unavailable(e.to_string())
}

#[async_trait]
impl BlobTransport for LoopbackBlobTransport {
    async fn has_remote(&self, hash: &str) -> Result<bool, TransportError> {
        self.remote.has_blob(hash).await.map_err(unavailable)
    }

    async fn upload(&self, hash: &str, data: &[u8]) -> Result<(), TransportError> {
        let stored = self.remote.put_blob(data).await.map_err(unavailable)?;
        if stored != hash {
            return Err(TransportError::Protocol(format!("uploaded blob hashed to {} not {}", stored, hash)));
        }
        Ok(())
    }

    async fn download(&self, hash: &str) -> Result<Option<Vec<u8>>, TransportError> {
        self.remote.get_blob(hash).await.map_err(unavailable)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome of one blob pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobSyncReport {
    pub uploaded: usize,
    pub downloaded: usize,
    /// Present on both sides already
    pub in_sync: usize,
    /// Referenced by a photo but held by neither side yet
    pub missing: Vec<String>,
    /// Hash and final error for transfers that ran out of attempts
    pub failed: Vec<(String, String)>,
}

impl BlobSyncReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.failed.is_empty()
    }
}

enum Transfer {
    Uploaded,
    Downloaded,
    InSync,
    Missing,
}

pub struct BlobSync {
    local: Arc<dyn BlobStore>,
    transport: Arc<dyn BlobTransport>,
    retry: RetryConfig,
}

impl BlobSync {
    pub fn new(local: Arc<dyn BlobStore>, transport: Arc<dyn BlobTransport>, retry: RetryConfig) -> Self {
        Self { local, transport, retry }
    }

    /// Store image bytes locally and return the hash to put on the photo.
    pub async fn store_local(&self, data: &[u8]) -> Result<String, StorageError> {
        self.local.put_blob(data).await
    }

    /// Transfer every blob referenced by a live photo on `replica`.
    #[tracing::instrument(skip(self, replica), fields(replica = %replica.id()))]
    pub async fn run(&self, replica: &Replica) -> Result<BlobSyncReport, StorageError> {
        let mut hashes: Vec<String> = replica
            .store()
            .list_kind(EntityKind::Photo)
            .await?
            .into_iter()
            .filter(|p| !p.deleted)
            .filter_map(|p| PhotoFields::from_value(&p.fields).ok()?.content_hash)
            .collect();
        hashes.sort();
        hashes.dedup();

        let mut report = BlobSyncReport::default();
        for hash in hashes {
            let outcome = retry("blob_transfer", &self.retry, || self.transfer(&hash)).await;
            match outcome {
                Ok(Transfer::Uploaded) => report.uploaded += 1,
                Ok(Transfer::Downloaded) => report.downloaded += 1,
                Ok(Transfer::InSync) => report.in_sync += 1,
                Ok(Transfer::Missing) => {
                    debug!(hash = %hash, "Blob not available on either side yet");
                    report.missing.push(hash);
                }
                Err(e) => {
                    warn!(hash = %hash, error = %e, "Blob transfer gave up");
                    report.failed.push((hash, e.to_string()));
                }
            }
        }

        info!(
            uploaded = report.uploaded,
            downloaded = report.downloaded,
            missing = report.missing.len(),
            failed = report.failed.len(),
            "Blob pass finished"
        );
        Ok(report)
    }

    async fn transfer(&self, hash: &str) -> Result<Transfer, BlobError> {
        let local = self.local.get_blob(hash).await?;
        let remote_has = self.transport.has_remote(hash).await?;

        match (local, remote_has) {
            (Some(_), true) => Ok(Transfer::InSync),
            (Some(data), false) => {
                let sent = self.transport.upload(hash, &data).await;
                metrics::record_blob_transfer("upload", sent.is_ok(), data.len());
                sent?;
                debug!(hash = %hash, bytes = data.len(), "Uploaded blob");
                Ok(Transfer::Uploaded)
            }
            (None, true) => {
                let Some(data) = self.transport.download(hash).await? else {
                    return Ok(Transfer::Missing);
                };
                let actual = blob_hash(&data);
                if actual != hash {
                    metrics::record_blob_transfer("download", false, data.len());
                    metrics::record_corruption(hash);
                    return Err(StorageError::Corruption {
                        id: hash.to_string(),
                        expected: hash.to_string(),
                        actual,
                    }
                    .into());
                }
                self.local.put_blob(&data).await?;
                metrics::record_blob_transfer("download", true, data.len());
                debug!(hash = %hash, bytes = data.len(), "Downloaded blob");
                Ok(Transfer::Downloaded)
            }
            (None, false) => Ok(Transfer::Missing),
        }
    }
}
