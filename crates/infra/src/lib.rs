//! Operational resilience layer for the CVE ingestion agents.
//!
//! Per-API rate limiting, retry with backoff, in-process job locks and the
//! job scheduler that ties them together.

pub mod config;
pub mod locks;
pub mod rate_limit;
pub mod records;
pub mod retry;
pub mod scheduler;

pub use config::{ConfigError, ResilienceConfig};
