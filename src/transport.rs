//! Transport adapter boundary.
//!
//! The engine only needs [`SyncTransport::send`]; HTTP, auth and routing live
//! outside this crate. [`LoopbackTransport`] pairs a client with an in-process
//! [`SyncServer`], round-tripping through JSON so tests exercise the real
//! wire format.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{SyncRequest, SyncResponse};
use crate::server::SyncServer;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("peer unavailable: {0}")]
    Unavailable(String),
    /// Malformed or incomplete response; not fixed by resending
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether resending the same request might succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Protocol(_))
    }
}

#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn send(&self, request: &SyncRequest, timeout: Duration) -> Result<SyncResponse, TransportError>;
}

/// In-process transport to a [`SyncServer`].
pub struct LoopbackTransport {
    server: Arc<SyncServer>,
}

impl LoopbackTransport {
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self { server }
    }

    #[must_use]
    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(value).map_err(|e| TransportError::Protocol(format!("encode failed: {}", e)))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(bytes).map_err(|e| TransportError::Protocol(format!("decode failed: {}", e)))
}

#[async_trait]
impl SyncTransport for LoopbackTransport {
    async fn send(&self, request: &SyncRequest, timeout: Duration) -> Result<SyncResponse, TransportError> {
        let body = encode(request)?;
        let exchange = async {
            let request: SyncRequest = decode(&body)?;
            let response = self
                .server
                .handle(request)
                .await
                .map_err(|e| TransportError::Unavailable(e.to_string()))?;
            encode(&response)
        };

        let reply = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        decode(&reply)
    }
}
