//! # Orchestration
//!
//! Higher-level driving of computation jobs on top of the client contract.
//!
//! - [`runner`]: Two-party job runner with polling, retries and validation
//! - [`metrics`]: Per-stage latency and outcome tracking with JSON export

pub mod metrics;
pub mod runner;

pub use metrics::JobMetrics;
pub use runner::{Job, JobOutcome, JobRunner, JobSummary, Party, RunnerConfig};
