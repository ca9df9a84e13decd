//! `cvewatch-core`: domain primitives shared by the ingestion runtime.
//!
//! This crate contains **pure domain** types (no async, no I/O).

pub mod error;
pub mod id;
pub mod run;

pub use error::{DomainError, DomainResult};
pub use id::RunId;
pub use run::{AgentRun, RunResult, RunStatus, SkippedRun};
