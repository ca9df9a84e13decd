//! Bounded exponential backoff with jitter.
//!
//! - Attempt 1 runs immediately
//! - After failed attempt `k`: wait `min(initial * multiplier^(k-1), max)`,
//!   scaled by a random factor in `[0.5, 1.5)` when jitter is on
//! - Non-retryable errors and the final failure are returned as [`RetryError`]
//!
//! Two shapes: [`RetryPolicy`] is configured once and applied to many calls;
//! [`RetryableOperation`] runs one call and keeps its attempt history.

pub mod operation;
pub mod policy;

pub use operation::RetryableOperation;
pub use policy::{with_retry, RetryConfig, RetryError, RetryPolicy};
