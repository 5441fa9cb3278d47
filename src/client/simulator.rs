//! # Local Simulator Backend
//!
//! An in-process stand-in for the remote coordination service, plus the
//! [`ComputationClient`] that talks to it. Used by the binary for local runs
//! and by the tests as the test double for lifecycle properties.
//!
//! ## Behaviour
//!
//! - Creation with a known instance id returns it unchanged (resume); an
//!   unknown non-empty id is registered under that id; an empty id gets a
//!   fresh uuid.
//! - `run_stage` for a stage that is already started or completed is absorbed
//!   and counted as a duplicate, so the stage body runs at most once per
//!   attempt.
//! - Stages finish inside `run_stage` when `stage_duration_ms` is zero,
//!   otherwise on a spawned task after the configured delay.
//! - `fail_stage` makes the first attempt of that stage fail; `abort_stage`
//!   fails that stage for good and leaves the instance `FAILED`.
//! - On joint stages the publisher reports generated server ips and the
//!   partner must be given them. The ips of a stage stay the same across
//!   retries of that stage.

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::client::{ComputationClient, InstanceCreationArgs, InstanceState};
use super::credentials::{AccessToken, CredentialResolver};
use super::validation::results_match;
use crate::common::config::SimulatorConfig;
use crate::common::error::{CoordinatorError, Result};
use crate::common::stage_flow::{InstanceStatus, Stage};

/// Which side of the computation a client drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    /// Starts joint stages and hands out server ips
    Publisher,
    /// Joins joint stages using the publisher's server ips
    Partner,
}

/// Remote-side record of one instance.
#[derive(Debug)]
struct SimInstance {
    args: InstanceCreationArgs,
    role: PartyRole,
    status: InstanceStatus,
    server_ips: Vec<String>,
    /// Addresses handed out per joint stage (publisher side)
    stage_ips: HashMap<Stage, Vec<String>>,
    completed: HashSet<Stage>,
    stage_runs: HashMap<Stage, u32>,
    duplicate_runs: u32,
    failed_once: HashSet<Stage>,
    output_override: Option<Value>,
}

impl SimInstance {
    fn new(args: InstanceCreationArgs, role: PartyRole) -> Self {
        Self {
            args,
            role,
            status: InstanceStatus::Created,
            server_ips: Vec::new(),
            stage_ips: HashMap::new(),
            completed: HashSet::new(),
            stage_runs: HashMap::new(),
            duplicate_runs: 0,
            failed_once: HashSet::new(),
            output_override: None,
        }
    }

    fn finish_stage(&mut self, stage: Stage, failed: bool, aborted: bool) {
        if aborted {
            self.status = InstanceStatus::Failed;
            return;
        }
        if failed {
            self.status = InstanceStatus::StageFailed(stage);
            return;
        }
        self.completed.insert(stage);
        self.status = match stage.next() {
            Some(_) => InstanceStatus::StageCompleted(stage),
            None => InstanceStatus::Completed,
        };
    }

    fn output(&self) -> Value {
        if let Some(value) = &self.output_override {
            return value.clone();
        }
        simulated_output(&self.args)
    }
}

/// Deterministic result artifact for a completed instance.
pub fn simulated_output(args: &InstanceCreationArgs) -> Value {
    let stages: Vec<&str> = Stage::ALL.iter().map(|s| s.as_str()).collect();
    match args {
        InstanceCreationArgs::Lift(lift) => json!({
            "type": "lift",
            "study_id": lift.study_id,
            "breakdown_key": lift.breakdown_key,
            "stages": stages,
        }),
        InstanceCreationArgs::Attribution(pa) => json!({
            "type": "attribution",
            "dataset_id": pa.dataset_id,
            "timestamp": pa.timestamp,
            "attribution_rule": pa.attribution_rule,
            "num_containers": pa.num_containers,
            "stages": stages,
        }),
    }
}

/// Shared in-memory coordination service.
///
/// Cloning is cheap and every clone sees the same instances, the way two
/// parties' clients would see one remote service.
#[derive(Clone, Default)]
pub struct SimulatedService {
    instances: Arc<RwLock<HashMap<String, SimInstance>>>,
    config: SimulatorConfig,
    required_token: Option<String>,
}

impl SimulatedService {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
            config,
            required_token: None,
        }
    }

    /// Reject every call not made with this token.
    pub fn with_required_token(mut self, token: impl Into<String>) -> Self {
        self.required_token = Some(token.into());
        self
    }

    fn authorize(&self, token: &AccessToken, action: &str) -> Result<()> {
        match &self.required_token {
            Some(required) if required != token.as_str() => Err(CoordinatorError::Remote {
                action: action.to_string(),
                message: "invalid OAuth access token".to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Number of instances the service knows about.
    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// How many times the body of `stage` actually ran for the instance.
    pub async fn stage_runs(&self, instance_id: &str, stage: Stage) -> u32 {
        self.instances
            .read()
            .await
            .get(instance_id)
            .and_then(|inst| inst.stage_runs.get(&stage).copied())
            .unwrap_or(0)
    }

    /// How many `run_stage` calls were absorbed as duplicates.
    pub async fn duplicate_runs(&self, instance_id: &str) -> u32 {
        self.instances
            .read()
            .await
            .get(instance_id)
            .map(|inst| inst.duplicate_runs)
            .unwrap_or(0)
    }

    /// Replace the result artifact an instance reports.
    pub async fn set_output(&self, instance_id: &str, output: Value) -> Result<()> {
        let mut instances = self.instances.write().await;
        let inst = instances
            .get_mut(instance_id)
            .ok_or_else(|| CoordinatorError::InstanceNotFound(instance_id.to_string()))?;
        inst.output_override = Some(output);
        Ok(())
    }

    async fn create(&self, args: &InstanceCreationArgs, role: PartyRole) -> Result<String> {
        let missing = match args {
            InstanceCreationArgs::Lift(lift) => lift.study_id.is_empty().then_some("study_id"),
            InstanceCreationArgs::Attribution(pa) => {
                pa.dataset_id.is_empty().then_some("dataset_id")
            }
        };
        if let Some(field) = missing {
            return Err(CoordinatorError::CreationFailed(format!(
                "{} instance needs a non-empty {}",
                args.kind(),
                field
            )));
        }

        let mut instances = self.instances.write().await;

        let instance_id = if args.instance_id().is_empty() {
            Uuid::new_v4().to_string()
        } else {
            args.instance_id().to_string()
        };

        if instances.contains_key(&instance_id) {
            info!("♻️  Resuming existing instance {}", instance_id);
            return Ok(instance_id);
        }

        instances.insert(instance_id.clone(), SimInstance::new(args.clone(), role));
        info!("🆕 Created {} instance {}", args.kind(), instance_id);
        Ok(instance_id)
    }

    async fn run_stage(
        &self,
        instance_id: &str,
        stage: Option<Stage>,
        server_ips: Option<&[String]>,
    ) -> Result<()> {
        let mut instances = self.instances.write().await;
        let inst = instances
            .get_mut(instance_id)
            .ok_or_else(|| CoordinatorError::InstanceNotFound(instance_id.to_string()))?;

        // An explicit stage that already ran is a duplicate, even on a
        // completed instance.
        if let Some(stage) = stage {
            if inst.completed.contains(&stage) || inst.status == InstanceStatus::Started(stage) {
                inst.duplicate_runs += 1;
                info!(
                    "🔁 Stage {} of instance {} already {}, ignoring duplicate",
                    stage,
                    instance_id,
                    if inst.completed.contains(&stage) { "completed" } else { "running" }
                );
                return Ok(());
            }
        }

        let terminal = || CoordinatorError::TerminalInstance {
            instance_id: instance_id.to_string(),
            status: inst.status.to_string(),
        };
        if inst.status.is_terminal() {
            return Err(terminal());
        }
        let Some(stage) = stage.or(inst.status.pending_stage()) else {
            return Err(terminal());
        };

        if inst.status == InstanceStatus::Started(stage) {
            inst.duplicate_runs += 1;
            info!(
                "🔁 Stage {} of instance {} already running, ignoring duplicate",
                stage, instance_id
            );
            return Ok(());
        }

        if inst.status.pending_stage() != Some(stage) {
            return Err(CoordinatorError::Remote {
                action: "running stage".to_string(),
                message: format!("{} is not runnable while instance is {}", stage, inst.status),
            });
        }

        if stage.is_joint() {
            match inst.role {
                PartyRole::Publisher => {
                    // A retried stage keeps its addresses so a partner that
                    // already joined still points at the right peers.
                    let ips = inst.stage_ips.entry(stage).or_insert_with(|| {
                        let mut rng = rand::thread_rng();
                        (0..2)
                            .map(|_| {
                                format!("10.0.{}.{}", rng.gen_range(0..=255), rng.gen_range(1..=254))
                            })
                            .collect()
                    });
                    inst.server_ips = ips.clone();
                }
                PartyRole::Partner => {
                    let ips = server_ips.filter(|ips| !ips.is_empty()).ok_or_else(|| {
                        CoordinatorError::MissingServerIps {
                            instance_id: instance_id.to_string(),
                            stage,
                        }
                    })?;
                    inst.server_ips = ips.to_vec();
                }
            }
        }

        inst.status = InstanceStatus::Started(stage);
        *inst.stage_runs.entry(stage).or_insert(0) += 1;

        let fail = self.config.fail_stage == Some(stage) && inst.failed_once.insert(stage);
        let abort = self.config.abort_stage == Some(stage);
        info!("▶️  Instance {} started stage {}", instance_id, stage);

        if self.config.stage_duration_ms == 0 {
            inst.finish_stage(stage, fail, abort);
            debug!("Instance {} is now {}", instance_id, inst.status);
            return Ok(());
        }

        drop(instances);

        let table = self.instances.clone();
        let delay = Duration::from_millis(self.config.stage_duration_ms);
        let id = instance_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut instances = table.write().await;
            if let Some(inst) = instances.get_mut(&id) {
                if inst.status == InstanceStatus::Started(stage) {
                    inst.finish_stage(stage, fail, abort);
                    debug!("Instance {} is now {}", id, inst.status);
                }
            }
        });

        Ok(())
    }

    async fn state(&self, instance_id: &str) -> Result<InstanceState> {
        let instances = self.instances.read().await;
        let inst = instances
            .get(instance_id)
            .ok_or_else(|| CoordinatorError::InstanceNotFound(instance_id.to_string()))?;
        Ok(InstanceState {
            status: inst.status,
            server_ips: inst.server_ips.clone(),
        })
    }

    async fn completed_output(&self, instance_id: &str) -> Result<Value> {
        let instances = self.instances.read().await;
        let inst = instances
            .get(instance_id)
            .ok_or_else(|| CoordinatorError::InstanceNotFound(instance_id.to_string()))?;
        if inst.status != InstanceStatus::Completed {
            return Err(CoordinatorError::NotCompleted {
                instance_id: instance_id.to_string(),
                status: inst.status.to_string(),
            });
        }
        Ok(inst.output())
    }
}

/// [`ComputationClient`] backed by a [`SimulatedService`].
pub struct SimulatorClient {
    role: PartyRole,
    service: SimulatedService,
    access_token: AccessToken,
}

impl SimulatorClient {
    /// Create a client, resolving its token from `config` or the environment.
    ///
    /// # Errors
    /// - `CredentialNotFound` when no token is configured anywhere
    pub fn new(config: &toml::Value, service: SimulatedService, role: PartyRole) -> Result<Self> {
        Self::with_resolver(config, &CredentialResolver::new(), service, role)
    }

    pub fn with_resolver(
        config: &toml::Value,
        resolver: &CredentialResolver,
        service: SimulatedService,
        role: PartyRole,
    ) -> Result<Self> {
        let access_token = resolver.resolve(config)?;
        Ok(Self {
            role,
            service,
            access_token,
        })
    }

    pub fn role(&self) -> PartyRole {
        self.role
    }
}

#[async_trait]
impl ComputationClient for SimulatorClient {
    fn backend_name(&self) -> &'static str {
        "simulator"
    }

    async fn create_instance(&self, args: &InstanceCreationArgs) -> Result<String> {
        self.service.authorize(&self.access_token, "creating instance")?;
        self.service.create(args, self.role).await
    }

    async fn run_stage(
        &self,
        instance_id: &str,
        stage: Option<Stage>,
        server_ips: Option<&[String]>,
    ) -> Result<()> {
        self.service.authorize(&self.access_token, "running stage")?;
        self.service.run_stage(instance_id, stage, server_ips).await
    }

    async fn update_instance(&self, instance_id: &str) -> Result<InstanceState> {
        self.service.authorize(&self.access_token, "updating instance")?;
        self.service.state(instance_id).await
    }

    async fn validate_results(
        &self,
        instance_id: &str,
        expected_result_path: Option<&Path>,
    ) -> Result<bool> {
        self.service.authorize(&self.access_token, "validating results")?;
        let output = self.service.completed_output(instance_id).await?;

        match expected_result_path {
            Some(path) => results_match(instance_id, &output, path),
            None => {
                warn!(
                    "⚠️  No expected result for instance {}; only completion was checked",
                    instance_id
                );
                Ok(true)
            }
        }
    }
}
