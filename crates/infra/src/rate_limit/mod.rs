//! Per-API token-bucket rate limiting for outbound calls.
//!
//! ## Design
//!
//! - Each API gets a bucket of `requests_per_minute` tokens
//! - Tokens refill continuously at `requests_per_minute / 60` per second
//! - A request costs one token; an empty bucket makes the caller wait
//! - Waiting never holds the bucket lock
//!
//! Job bodies usually go through [`RateLimiterRegistry::acquire`] (or
//! [`RateLimiterRegistry::call`]) before each request to a feed.

pub mod bucket;
pub mod limiter;
pub mod registry;

pub use bucket::TokenBucket;
pub use limiter::{RateLimiter, RateLimiterStats};
pub use registry::{RateLimitError, RateLimiterRegistry};
