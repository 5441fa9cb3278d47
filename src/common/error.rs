//! # Coordinator Errors
//!
//! A single typed error for the library. The binary wraps it in `anyhow`,
//! but callers that need to tell "no credential configured" apart from any
//! other failure can match on [`CoordinatorError::CredentialNotFound`].

use thiserror::Error;

use super::stage_flow::Stage;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Neither the config section nor the environment supplied a token.
    #[error(
        "graph api token not found: set the {env_var} environment variable \
         or add access_token to the graphapi section of the config file"
    )]
    CredentialNotFound { env_var: String },

    /// The remote side rejected a job-creation request.
    #[error("failed to create instance: {0}")]
    CreationFailed(String),

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    /// `run_stage` was called on an instance that already finished.
    #[error("instance {instance_id} is in terminal state {status}")]
    TerminalInstance { instance_id: String, status: String },

    /// A joint stage was started by the joining party without peer addresses.
    #[error("stage {stage} of instance {instance_id} needs server ips from the other party")]
    MissingServerIps { instance_id: String, stage: Stage },

    #[error("instance {instance_id} has not completed (status {status})")]
    NotCompleted { instance_id: String, status: String },

    /// A stage kept failing after every retry the runner allowed.
    #[error("stage {stage} failed after {attempts} attempts")]
    StageFailed { stage: Stage, attempts: u32 },

    #[error("timed out waiting for stage {stage} of instance {instance_id}")]
    StageTimeout { instance_id: String, stage: Stage },

    #[error("unknown instance status '{0}'")]
    UnknownStatus(String),

    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    /// Error payload returned by the remote API.
    #[error("remote error while {action}: {message}")]
    Remote { action: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CoordinatorError {
    /// True when the failure is the missing-credential case.
    pub fn is_credential_not_found(&self) -> bool {
        matches!(self, CoordinatorError::CredentialNotFound { .. })
    }
}
