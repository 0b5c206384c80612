//! Retry, backoff and cancellation primitives.

pub mod cancel;
pub mod retry;

pub use cancel::CancelToken;
pub use retry::{retry, RetryConfig};
