//! Strategy error types.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for strategy operations.
pub type StrategyResult<T> = Result<T, StrategyError>;

/// Errors raised by deployment strategies.
///
/// `Configuration`, `NotFound`, and `HealthTimeout` are never retried;
/// `Runtime` and `HealthTimeout` trigger a best-effort cleanup before
/// they surface.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// Required artifacts are missing or resource limits exceed host
    /// capacity.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The deployment has no live runtime handle (or a rollback source
    /// is absent).
    #[error("not found: {0}")]
    NotFound(String),

    /// An external runtime call failed: build failure, spawn failure,
    /// API error.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The runtime started but never became healthy within the wait
    /// window.
    #[error("deployment did not become healthy within {0:?}")]
    HealthTimeout(Duration),
}
