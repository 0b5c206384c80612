//! Configuration for a sync replica.
//!
//! # Example
//!
//! ```
//! use inspection_sync::SyncConfig;
//! use std::time::Duration;
//!
//! // Minimal config (uses defaults, in-memory storage)
//! let config = SyncConfig::default();
//! assert_eq!(config.authority_replica_id, "server");
//! assert_eq!(config.request_timeout(), Duration::from_secs(30));
//!
//! // Tablet persisting to SQLite
//! let config = SyncConfig {
//!     replica_id: "tablet-7".into(),
//!     database_url: Some("sqlite:inspections.db?mode=rwc".into()),
//!     retry_max_attempts: 8,
//!     ..Default::default()
//! };
//! assert_eq!(config.retry_config().max_retries, Some(8));
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::resilience::RetryConfig;

/// Configuration for one replica and its sync peer.
///
/// All fields have defaults. A real deployment should at least set
/// `replica_id` to something unique per device.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// This replica's id, stamped on every local edit
    #[serde(default = "default_replica_id")]
    pub replica_id: String,

    /// Replica whose edits win timestamp ties during merges
    #[serde(default = "default_authority_replica_id")]
    pub authority_replica_id: String,

    /// Peer the engine syncs with; checkpoints are stored under this id
    #[serde(default = "default_peer_id")]
    pub peer_id: String,

    /// SQLite connection string (e.g. "sqlite:sync.db?mode=rwc"); None keeps everything in memory
    #[serde(default)]
    pub database_url: Option<String>,

    /// Per-request network timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Session retry backoff
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub retry_factor: f64,
    /// 0 = retry until cancelled
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,

    /// Attempts per photo blob before it is reported as failed
    #[serde(default = "default_blob_retry_attempts")]
    pub blob_retry_attempts: usize,
}

fn default_replica_id() -> String { "local".to_string() }
fn default_authority_replica_id() -> String { "server".to_string() }
fn default_peer_id() -> String { "server".to_string() }
fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_retry_initial_delay_ms() -> u64 { 500 }
fn default_retry_max_delay_ms() -> u64 { 30_000 }
fn default_retry_factor() -> f64 { 2.0 }
fn default_retry_max_attempts() -> usize { 5 }
fn default_retry_jitter() -> f64 { 0.25 }
fn default_blob_retry_attempts() -> usize { 3 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            replica_id: default_replica_id(),
            authority_replica_id: default_authority_replica_id(),
            peer_id: default_peer_id(),
            database_url: None,
            request_timeout_ms: default_request_timeout_ms(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_factor: default_retry_factor(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_jitter: default_retry_jitter(),
            blob_retry_attempts: default_blob_retry_attempts(),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Backoff for whole sync sessions.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            factor: self.retry_factor,
            max_retries: (self.retry_max_attempts > 0).then_some(self.retry_max_attempts),
            jitter: self.retry_jitter,
        }
    }

    /// Same backoff, bounded by `blob_retry_attempts`.
    #[must_use]
    pub fn blob_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: Some(self.blob_retry_attempts.max(1)),
            ..self.retry_config()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"replica_id": "tablet-1", "retry_max_attempts": 0}"#).unwrap();
        assert_eq!(config.replica_id, "tablet-1");
        assert_eq!(config.peer_id, "server");
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.retry_config().max_retries, None);
    }

    #[test]
    fn test_retry_config_mapping() {
        let config = SyncConfig {
            retry_initial_delay_ms: 10,
            retry_max_delay_ms: 40,
            retry_jitter: 0.0,
            blob_retry_attempts: 2,
            ..Default::default()
        };
        let retry = config.retry_config();
        assert_eq!(retry.initial_delay, Duration::from_millis(10));
        assert_eq!(retry.delay_for(5), Duration::from_millis(40));
        assert_eq!(config.blob_retry_config().max_retries, Some(2));
    }
}
