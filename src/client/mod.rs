//! # Client Components
//!
//! Everything needed to drive one remote computation instance:
//!
//! ## Lifecycle Contract ([`client`])
//! The [`ComputationClient`] trait and the types it exchanges.
//!
//! ## Credentials ([`credentials`])
//! Token resolution from config, then environment.
//!
//! ## Backends
//! - [`graph_api`]: Graph API requests over an injected transport
//! - [`simulator`]: In-process service for local runs and tests
//!
//! [`ClientFactory`] picks the backend named in `[coordinator] backend`.

pub mod client;
pub mod credentials;
pub mod graph_api;
pub mod simulator;
pub mod validation;

use std::sync::Arc;

use crate::common::config::{BackendKind, CoordinatorConfig};
use crate::common::error::{CoordinatorError, Result};

// Re-export for convenience
pub use client::{
    AttributionInstanceArgs, ComputationClient, InstanceCreationArgs, InstanceState,
    LiftInstanceArgs,
};
pub use credentials::{AccessToken, CredentialResolver};
pub use graph_api::{GraphApiClient, GraphApiTransport};
pub use simulator::{PartyRole, SimulatedService, SimulatorClient};

/// Builds clients for the backend selected by configuration.
pub struct ClientFactory {
    backend: BackendKind,
    graphapi: toml::Value,
    resolver: CredentialResolver,
    service: SimulatedService,
    transport: Option<Arc<dyn GraphApiTransport>>,
}

impl ClientFactory {
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self {
            backend: config.coordinator.backend,
            graphapi: config.graphapi.clone(),
            resolver: CredentialResolver::new(),
            service: SimulatedService::new(config.simulator.clone()),
            transport: None,
        }
    }

    pub fn with_resolver(mut self, resolver: CredentialResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Transport used by `graph_api` clients.
    pub fn with_transport(mut self, transport: Arc<dyn GraphApiTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Service shared by all `simulator` clients built by this factory.
    pub fn with_service(mut self, service: SimulatedService) -> Self {
        self.service = service;
        self
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Resolve the credential without building a client.
    pub fn check_credentials(&self) -> Result<AccessToken> {
        self.resolver.resolve(&self.graphapi)
    }

    /// Build a client for one party. Fails if no credential can be resolved.
    pub fn build(&self, role: PartyRole) -> Result<Arc<dyn ComputationClient>> {
        match self.backend {
            BackendKind::Simulator => Ok(Arc::new(SimulatorClient::with_resolver(
                &self.graphapi,
                &self.resolver,
                self.service.clone(),
                role,
            )?)),
            BackendKind::GraphApi => {
                let transport = self.transport.clone().ok_or_else(|| {
                    CoordinatorError::Config(
                        "graph_api backend needs a transport; none is configured".to_string(),
                    )
                })?;
                Ok(Arc::new(GraphApiClient::with_resolver(
                    &self.graphapi,
                    &self.resolver,
                    transport,
                )?))
            }
        }
    }
}
