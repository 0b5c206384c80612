// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with capped exponential backoff and jitter.
//!
//! Different presets are available for different use cases.
//!
//! # Example
//!
//! ```
//! use inspection_sync::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Daemon: never give up on reconnection
//! let daemon = RetryConfig::daemon();
//! assert_eq!(daemon.max_retries, None); // Infinite
//!
//! // Session: a handful of attempts per sync
//! let session = RetryConfig::session();
//! assert_eq!(session.max_retries, Some(5));
//! assert!(session.delay_for(10) <= session.max_delay);
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for opening a store
/// - [`RetryConfig::daemon()`] - Infinite retry for background loops
/// - [`RetryConfig::query()`] - Quick retry for individual queries
/// - [`RetryConfig::session()`] - Sync session attempts over a flaky network
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
    /// Fraction of each delay randomized, 0.0..=1.0
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Fast-fail retry for opening a store.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Infinite retry for long-running loops.
    /// Retries forever with exponential backoff capped at 5 minutes.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            max_retries: None, // Infinite
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300), // Cap at 5 minutes
            factor: 2.0,
            jitter: 0.2,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Whole sync sessions over an unreliable mobile link.
    /// Jittered so a fleet of clients coming back online doesn't stampede.
    #[must_use]
    pub fn session() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.25,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[must_use]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Un-jittered delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn base_delay_for(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = delay.mul_f64(self.factor).min(self.max_delay);
            if delay == self.max_delay {
                break;
            }
        }
        delay.min(self.max_delay)
    }

    /// Jittered delay before retry number `attempt`, never above `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let base = self.base_delay_for(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let scale = 1.0 - jitter + rand::thread_rng().gen_range(0.0..=jitter);
        base.mul_f64(scale).min(self.max_delay)
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                let delay = config.delay_for(attempts);

                match config.max_retries {
                    Some(max) if attempts >= max => return Err(err),
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    ),
                    None => warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    ),
                }

                sleep(delay).await;
            }
        }
    }
}
