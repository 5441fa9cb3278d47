//! # Computation Client
//!
//! The capability interface an orchestrator uses to drive one job instance
//! through its lifecycle, plus the argument and state types it exchanges.
//!
//! ## Lifecycle
//!
//! ```text
//! uncreated ──create_instance──▶ CREATED
//!     ──run_stage──▶ <STAGE>_STARTED ──▶ <STAGE>_COMPLETED | <STAGE>_FAILED
//!     ... (one run_stage per stage) ...
//!     ──▶ COMPLETED
//! ```
//!
//! `update_instance` only observes the lifecycle; it never moves it.
//!
//! ## Delivery Semantics
//!
//! `run_stage` is at-least-once at this layer. An orchestrator that does not
//! know whether its last call landed simply calls again; a backend forwards
//! the duplicate and the service absorbs it. Clients never retry on their own.
//!
//! ## Implementations
//!
//! - [`GraphApiClient`](super::graph_api::GraphApiClient): Graph API requests over
//!   an injected transport
//! - [`SimulatorClient`](super::simulator::SimulatorClient): in-process service
//!   used for local runs and tests

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::common::error::Result;
use crate::common::stage_flow::{InstanceStatus, Stage};

/// Arguments for a private-lift instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiftInstanceArgs {
    /// Non-empty to resume a prior attempt
    pub instance_id: String,
    pub study_id: String,
    pub breakdown_key: BTreeMap<String, String>,
}

/// Arguments for a private-attribution instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionInstanceArgs {
    /// Non-empty to resume a prior attempt
    pub instance_id: String,
    pub dataset_id: String,
    pub timestamp: String,
    pub attribution_rule: String,
    pub num_containers: String,
}

/// Creation payload, one variant per computation type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceCreationArgs {
    Lift(LiftInstanceArgs),
    Attribution(AttributionInstanceArgs),
}

impl InstanceCreationArgs {
    /// The resumption key. Empty when no prior attempt exists.
    pub fn instance_id(&self) -> &str {
        match self {
            InstanceCreationArgs::Lift(args) => &args.instance_id,
            InstanceCreationArgs::Attribution(args) => &args.instance_id,
        }
    }

    /// Copy of these args pointing at an existing instance.
    pub fn with_instance_id(&self, instance_id: &str) -> Self {
        let mut args = self.clone();
        match &mut args {
            InstanceCreationArgs::Lift(a) => a.instance_id = instance_id.to_string(),
            InstanceCreationArgs::Attribution(a) => a.instance_id = instance_id.to_string(),
        }
        args
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InstanceCreationArgs::Lift(_) => "lift",
            InstanceCreationArgs::Attribution(_) => "attribution",
        }
    }
}

/// Snapshot of a remote instance, produced fresh on every poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceState {
    pub status: InstanceStatus,
    /// Addresses the other party connects to during joint stages
    pub server_ips: Vec<String>,
}

impl InstanceState {
    pub fn new(status: InstanceStatus) -> Self {
        Self {
            status,
            server_ips: Vec::new(),
        }
    }
}

/// Lifecycle driver for remote computation instances.
///
/// Every operation may wait on I/O. Implementations hold their own credential
/// and share no mutable state with other clients.
#[async_trait]
pub trait ComputationClient: Send + Sync {
    /// Short backend name used in logs.
    fn backend_name(&self) -> &'static str;

    /// Create an instance, or resume the one named in `args`.
    ///
    /// # Returns
    /// - `Ok(id)`: The new instance id, or the embedded id when resuming
    /// - `Err(CreationFailed)`: The remote side rejected the submission
    async fn create_instance(&self, args: &InstanceCreationArgs) -> Result<String>;

    /// Advance the instance by one stage.
    ///
    /// # Arguments
    /// - `instance_id`: Instance to advance
    /// - `stage`: Explicit stage to run; `None` runs the next pending stage
    /// - `server_ips`: The other party's addresses, for joint stages
    async fn run_stage(
        &self,
        instance_id: &str,
        stage: Option<Stage>,
        server_ips: Option<&[String]>,
    ) -> Result<()>;

    /// Read the current state of the instance. Never mutates it.
    async fn update_instance(&self, instance_id: &str) -> Result<InstanceState>;

    /// Check the completed instance's output.
    ///
    /// # Returns
    /// - `Ok(true)`: Output matches `expected_result_path`, or no path was given
    ///   and the instance completed
    /// - `Ok(false)`: Output differs from the expected artifact
    /// - `Err(NotCompleted)`: The instance has not finished all stages
    async fn validate_results(
        &self,
        instance_id: &str,
        expected_result_path: Option<&Path>,
    ) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lift_args(id: &str) -> InstanceCreationArgs {
        InstanceCreationArgs::Lift(LiftInstanceArgs {
            instance_id: id.to_string(),
            study_id: "s1".to_string(),
            breakdown_key: BTreeMap::from([("k".to_string(), "v".to_string())]),
        })
    }

    #[test]
    fn test_instance_id_accessors() {
        let args = lift_args("");
        assert_eq!(args.instance_id(), "");
        let resumed = args.with_instance_id("abc123");
        assert_eq!(resumed.instance_id(), "abc123");
        assert_eq!(resumed.kind(), "lift");
        // The original args are untouched.
        assert_eq!(args.instance_id(), "");
    }

    #[test]
    fn test_args_are_tagged_by_type() {
        let json = serde_json::to_value(lift_args("abc123")).unwrap();
        assert_eq!(json["type"], "lift");
        assert_eq!(json["study_id"], "s1");

        let parsed: InstanceCreationArgs = serde_json::from_value(serde_json::json!({
            "type": "attribution",
            "instance_id": "",
            "dataset_id": "d1",
            "timestamp": "1650000000",
            "attribution_rule": "last_click_1d",
            "num_containers": "4",
        }))
        .unwrap();
        assert_eq!(parsed.kind(), "attribution");
    }
}
