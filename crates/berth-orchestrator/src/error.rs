//! Orchestrator error types.

use thiserror::Error;

use berth_core::DeploymentStatus;
use berth_state::StateError;
use berth_strategy::StrategyError;

/// Result type alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The operation is not valid for the deployment's current status.
    #[error("{operation} not valid for deployment in status {status}")]
    InvalidState {
        status: DeploymentStatus,
        operation: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl OrchestratorError {
    pub(crate) fn invalid_state(status: DeploymentStatus, operation: &str) -> Self {
        Self::InvalidState {
            status,
            operation: operation.to_string(),
        }
    }
}
