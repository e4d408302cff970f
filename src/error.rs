//! Orchestrator-wide error taxonomy.
//!
//! One stable set of error kinds is shared by every component so callers
//! (and the HTTP boundary) can match on meaning rather than on source.

use thiserror::Error;

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Model already exists: {0}")]
    AlreadyExists(String),

    #[error("Model not found: {0}")]
    NotFound(String),

    #[error("Operation not permitted in current state: {0}")]
    Conflict(String),

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Failed to launch instance: {0}")]
    LaunchFailure(String),

    #[error("Failed to stop instance: {0}")]
    StopFailure(String),

    #[error("Instance started but never became ready within {0}s")]
    ReadinessTimeout(u64),

    #[error("Model unhealthy: {0}")]
    Unhealthy(String),

    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("Rate limit exceeded for model {0}")]
    RateLimited(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// HTTP status the API layer maps this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidConfig(_) => 422,
            Self::AlreadyExists(_) => 409,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::InsufficientResources(_) => 503,
            Self::LaunchFailure(_) | Self::StopFailure(_) | Self::ReadinessTimeout(_) => 500,
            Self::Unhealthy(_) => 503,
            Self::DependencyUnavailable(_) => 503,
            Self::RateLimited(_) => 429,
            Self::Internal(_) => 500,
        }
    }

    /// True for errors a caller may retry without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientResources(_)
                | Self::DependencyUnavailable(_)
                | Self::RateLimited(_)
                | Self::Unhealthy(_)
        )
    }
}

/// Shorthand used across the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            OrchestratorError::InvalidConfig("x".into()).status_code(),
            422
        );
        assert_eq!(OrchestratorError::NotFound("x".into()).status_code(), 404);
        assert_eq!(
            OrchestratorError::AlreadyExists("x".into()).status_code(),
            409
        );
        assert_eq!(OrchestratorError::RateLimited("x".into()).status_code(), 429);
        assert_eq!(
            OrchestratorError::InsufficientResources("x".into()).status_code(),
            503
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(OrchestratorError::RateLimited("m".into()).is_retryable());
        assert!(!OrchestratorError::InvalidConfig("m".into()).is_retryable());
        assert!(!OrchestratorError::AlreadyExists("m".into()).is_retryable());
    }
}
