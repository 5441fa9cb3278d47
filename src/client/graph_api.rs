//! # Graph API Client
//!
//! [`ComputationClient`] backend that talks to the Graph API coordination
//! endpoints. It builds the requests and interprets the responses; sending
//! them is delegated to a [`GraphApiTransport`] supplied by the caller.
//!
//! ## Endpoints
//!
//! | Operation | Request |
//! |---|---|
//! | resume | `GET {instance_id}?fields=id` |
//! | create (lift) | `POST {study_id}/instances` with `breakdown_key` |
//! | create (attribution) | `POST {dataset_id}/instance` with `attribution_rule`, `timestamp`, `num_containers` |
//! | run stage | `POST {instance_id}` with `operation=NEXT`, or `operation=RUN&stage=..` |
//! | poll | `GET {instance_id}?fields=status,server_ips` |
//! | validate | `GET {instance_id}?fields=status,results` |
//!
//! Every request carries the resolved `access_token`.

use async_trait::async_trait;
use log::{info, warn};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use super::client::{ComputationClient, InstanceCreationArgs, InstanceState};
use super::credentials::{AccessToken, CredentialResolver};
use super::validation::results_match;
use crate::common::constants::GRAPH_API_URL;
use crate::common::error::{CoordinatorError, Result};
use crate::common::stage_flow::{InstanceStatus, Stage};

/// Query/form parameters of a Graph API request.
pub type Params = BTreeMap<String, String>;

/// Sends Graph API requests and returns the decoded JSON body.
///
/// Implementations own timeouts and connection handling. A response carrying
/// an `{"error": ..}` payload is returned as `Ok` and interpreted by the client.
#[async_trait]
pub trait GraphApiTransport: Send + Sync {
    async fn get(&self, url: &str, params: &Params) -> Result<Value>;
    async fn post(&self, url: &str, params: &Params) -> Result<Value>;
}

/// Graph API backed computation client.
pub struct GraphApiClient {
    base_url: String,
    access_token: AccessToken,
    transport: Arc<dyn GraphApiTransport>,
}

impl GraphApiClient {
    /// Create a client, resolving its token from `config` or the environment.
    ///
    /// # Arguments
    /// - `config`: The `[graphapi]` section of the coordinator config
    /// - `transport`: Sends the requests built by this client
    ///
    /// # Errors
    /// - `CredentialNotFound` when no token is configured anywhere
    pub fn new(config: &toml::Value, transport: Arc<dyn GraphApiTransport>) -> Result<Self> {
        Self::with_resolver(config, &CredentialResolver::new(), transport)
    }

    pub fn with_resolver(
        config: &toml::Value,
        resolver: &CredentialResolver,
        transport: Arc<dyn GraphApiTransport>,
    ) -> Result<Self> {
        let access_token = resolver.resolve(config)?;
        Ok(Self {
            base_url: GRAPH_API_URL.to_string(),
            access_token,
            transport,
        })
    }

    /// Point the client at another API root (staging, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn params(&self) -> Params {
        let mut params = Params::new();
        params.insert("access_token".to_string(), self.access_token.as_str().to_string());
        params
    }

    async fn resume_instance(&self, instance_id: &str) -> Result<String> {
        let mut params = self.params();
        params.insert("fields".to_string(), "id".to_string());

        let body = self.transport.get(&self.url(instance_id), &params).await?;
        check_err(&body, "resuming instance")
            .map_err(|e| CoordinatorError::CreationFailed(e.to_string()))?;

        info!("♻️  Resuming existing instance {}", instance_id);
        Ok(instance_id.to_string())
    }

    async fn fetch_fields(&self, instance_id: &str, fields: &str, action: &str) -> Result<Value> {
        let mut params = self.params();
        params.insert("fields".to_string(), fields.to_string());

        let body = self.transport.get(&self.url(instance_id), &params).await?;
        check_err(&body, action)?;
        Ok(body)
    }
}

/// Turn an `{"error": {"message": ..}}` payload into a [`CoordinatorError::Remote`].
fn check_err(body: &Value, action: &str) -> Result<()> {
    match body.get("error") {
        None | Some(Value::Null) => Ok(()),
        Some(err) => {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            Err(CoordinatorError::Remote {
                action: action.to_string(),
                message,
            })
        }
    }
}

fn parse_status(body: &Value) -> Result<InstanceStatus> {
    body.get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| CoordinatorError::UnknownStatus(body.to_string()))?
        .parse()
}

#[async_trait]
impl ComputationClient for GraphApiClient {
    fn backend_name(&self) -> &'static str {
        "graph_api"
    }

    async fn create_instance(&self, args: &InstanceCreationArgs) -> Result<String> {
        if !args.instance_id().is_empty() {
            return self.resume_instance(args.instance_id()).await;
        }

        let mut params = self.params();
        let url = match args {
            InstanceCreationArgs::Lift(lift) => {
                params.insert(
                    "breakdown_key".to_string(),
                    serde_json::to_string(&lift.breakdown_key)?,
                );
                self.url(&format!("{}/instances", lift.study_id))
            }
            InstanceCreationArgs::Attribution(pa) => {
                params.insert("attribution_rule".to_string(), pa.attribution_rule.clone());
                params.insert("timestamp".to_string(), pa.timestamp.clone());
                params.insert("num_containers".to_string(), pa.num_containers.clone());
                self.url(&format!("{}/instance", pa.dataset_id))
            }
        };

        let body = self.transport.post(&url, &params).await?;
        check_err(&body, "creating instance")
            .map_err(|e| CoordinatorError::CreationFailed(e.to_string()))?;

        let instance_id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| CoordinatorError::CreationFailed(format!("response has no id: {}", body)))?;

        info!("🆕 Created {} instance {}", args.kind(), instance_id);
        Ok(instance_id.to_string())
    }

    async fn run_stage(
        &self,
        instance_id: &str,
        stage: Option<Stage>,
        server_ips: Option<&[String]>,
    ) -> Result<()> {
        let mut params = self.params();
        match stage {
            Some(stage) => {
                params.insert("operation".to_string(), "RUN".to_string());
                params.insert("stage".to_string(), stage.to_string());
            }
            None => {
                params.insert("operation".to_string(), "NEXT".to_string());
            }
        }
        if let Some(ips) = server_ips {
            params.insert("server_ips".to_string(), serde_json::to_string(ips)?);
        }

        let body = self.transport.post(&self.url(instance_id), &params).await?;
        check_err(&body, "running stage")?;

        info!(
            "▶️  Requested stage {} for instance {}",
            stage.map(|s| s.to_string()).unwrap_or_else(|| "NEXT".to_string()),
            instance_id
        );
        Ok(())
    }

    async fn update_instance(&self, instance_id: &str) -> Result<InstanceState> {
        let body = self
            .fetch_fields(instance_id, "status,server_ips", "updating instance")
            .await?;

        let status = parse_status(&body)?;
        let server_ips = body
            .get("server_ips")
            .and_then(Value::as_array)
            .map(|ips| {
                ips.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(InstanceState { status, server_ips })
    }

    async fn validate_results(
        &self,
        instance_id: &str,
        expected_result_path: Option<&Path>,
    ) -> Result<bool> {
        let body = self
            .fetch_fields(instance_id, "status,results", "validating results")
            .await?;

        let status = parse_status(&body)?;
        if status != InstanceStatus::Completed {
            return Err(CoordinatorError::NotCompleted {
                instance_id: instance_id.to_string(),
                status: status.to_string(),
            });
        }

        match expected_result_path {
            Some(path) => {
                let actual = body.get("results").cloned().unwrap_or(Value::Null);
                results_match(instance_id, &actual, path)
            }
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
