//! # Configuration
//!
//! TOML configuration for the coordinator binary and the backends.
//!
//! The `[graphapi]` section is kept as a raw [`toml::Value`]: it is only
//! normalized into [`GraphApiConfig`] by the credential resolver, which treats
//! a section that does not match the schema as "no token configured".
//!
//! # Example TOML
//!
//! ```toml
//! [coordinator]
//! backend = "simulator"
//! poll_interval_ms = 200
//! stage_timeout_secs = 60
//! max_stage_retries = 2
//!
//! [graphapi]
//! access_token = "EAAB..."
//!
//! [simulator]
//! stage_duration_ms = 100
//!
//! [[jobs]]
//! name = "lift_study_1"
//!
//! [jobs.publisher]
//! type = "lift"
//! instance_id = ""
//! study_id = "1234"
//! breakdown_key = { cell_id = "1", objective_id = "2" }
//!
//! [jobs.partner]
//! type = "lift"
//! instance_id = ""
//! study_id = "1234"
//! breakdown_key = {}
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use super::error::CoordinatorError;
use super::stage_flow::Stage;
use crate::client::InstanceCreationArgs;

/// Load a TOML configuration file and deserialize it into the specified type.
///
/// # Arguments
/// - `path`: Path to the TOML configuration file
///
/// # Returns
/// - `Ok(T)`: Successfully loaded and parsed configuration
/// - `Err`: File I/O or parsing error
pub fn load_config<T>(path: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)?;
    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Complete coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub coordinator: CoordinatorSection,
    /// Raw Graph API section; see [`GraphApiConfig`] for the recognized schema.
    #[serde(default = "empty_table")]
    pub graphapi: toml::Value,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl CoordinatorConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        load_config(path)
    }
}

/// Backend selection and polling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSection {
    pub backend: BackendKind,
    /// Delay between two `update_instance` polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on how long a single stage may take before the runner gives up
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// How many times a failed stage is re-run before the job is marked failed
    #[serde(default = "default_max_stage_retries")]
    pub max_stage_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    GraphApi,
    Simulator,
}

/// Recognized schema of the `[graphapi]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphApiConfig {
    pub access_token: String,
}

impl GraphApiConfig {
    /// Normalize a raw config mapping into the recognized schema.
    pub fn from_value(value: &toml::Value) -> std::result::Result<Self, CoordinatorError> {
        value
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| CoordinatorError::Config(e.to_string()))
    }
}

/// Knobs for the local simulator backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// How long each stage runs. Zero finishes the stage inside `run_stage`.
    #[serde(default)]
    pub stage_duration_ms: u64,
    /// Stage that fails on its first attempt (failure injection)
    #[serde(default)]
    pub fail_stage: Option<Stage>,
    /// Stage whose failure is unrecoverable: the instance ends up `FAILED`
    #[serde(default)]
    pub abort_stage: Option<Stage>,
}

/// One two-party job to drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub publisher: InstanceCreationArgs,
    pub partner: InstanceCreationArgs,
    /// JSON artifact the publisher's results are compared against
    #[serde(default)]
    pub expected_result_path: Option<PathBuf>,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_stage_timeout_secs() -> u64 {
    600
}

fn default_max_stage_retries() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_graph_api_config_normalization() {
        let value: toml::Value = toml::from_str(r#"access_token = "tok-A""#).unwrap();
        let config = GraphApiConfig::from_value(&value).unwrap();
        assert_eq!(config.access_token, "tok-A");

        assert!(GraphApiConfig::from_value(&empty_table()).is_err());

        let wrong_type: toml::Value = toml::from_str("access_token = 42").unwrap();
        assert!(GraphApiConfig::from_value(&wrong_type).is_err());
    }

    #[test]
    fn test_load_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[coordinator]
backend = "simulator"
poll_interval_ms = 10

[simulator]
stage_duration_ms = 5
fail_stage = "ID_MATCH"

[[jobs]]
name = "pl"
expected_result_path = "/tmp/expected.json"

[jobs.publisher]
type = "lift"
instance_id = ""
study_id = "s1"
breakdown_key = {{ k = "v" }}

[jobs.partner]
type = "attribution"
instance_id = "p1"
dataset_id = "d1"
timestamp = "1650000000"
attribution_rule = "last_click_1d"
num_containers = "2"
"#
        )
        .unwrap();

        let config = CoordinatorConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.coordinator.backend, BackendKind::Simulator);
        assert_eq!(config.coordinator.poll_interval_ms, 10);
        assert_eq!(config.coordinator.max_stage_retries, 2);
        assert_eq!(config.simulator.fail_stage, Some(Stage::IdMatch));
        assert!(config.graphapi.as_table().unwrap().is_empty());

        let job = &config.jobs[0];
        assert_eq!(job.publisher.instance_id(), "");
        assert_eq!(job.partner.instance_id(), "p1");
        assert!(job.expected_result_path.is_some());
    }
}
