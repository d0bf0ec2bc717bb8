//! Error types for tree placement and graph operations

use thiserror::Error;

/// Tree placement error types
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed connect/disconnect/create request against the media graph
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// Operation not allowed in the tree's current state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// No node admits more load and the cluster cannot grow
    #[error("No capacity: {0}")]
    NoCapacity(String),

    /// The media driver reported a failure; local changes were rolled back
    #[error("Remote operation failed: {0}")]
    RemoteOperationFailed(String),

    /// Elastic growth itself failed
    #[error("Provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Node still hosts pipelines and cannot be removed
    #[error("Node busy: {0}")]
    NodeBusy(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Whether the caller may back off and retry the same request
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoCapacity(_) | Self::ProvisioningFailed(_) | Self::RemoteOperationFailed(_)
        )
    }
}

/// Result type for tree placement operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::NoCapacity("full".into()).is_retryable());
        assert!(Error::ProvisioningFailed("boom".into()).is_retryable());
        assert!(!Error::InvalidTopology("self loop".into()).is_retryable());
        assert!(!Error::InvalidTransition("closed".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::NoCapacity("all 2 nodes saturated".into());
        assert_eq!(err.to_string(), "No capacity: all 2 nodes saturated");
    }
}
