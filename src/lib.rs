//! # pc-coordinator
//!
//! Client-side coordination of multi-party private-computation jobs.
//!
//! - [`client`]: The [`ComputationClient`](client::ComputationClient) lifecycle
//!   contract, credential resolution and the backends
//! - [`runner`]: Drives publisher/partner jobs through every stage
//! - [`common`]: Configuration, errors and the stage flow

pub mod client;
pub mod common;
pub mod runner;

pub use client::{ComputationClient, CredentialResolver, InstanceCreationArgs, InstanceState};
pub use common::error::{CoordinatorError, Result};
pub use common::stage_flow::{InstanceStatus, Stage};
