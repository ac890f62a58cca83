//! Error types for the NetApp client
//!
//! Provides structured error types for the middleware orchestration client,
//! the resource readiness monitor and the NetApp connection manager.

use thiserror::Error;

/// Unified error type for the client
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Middleware Errors
    // =========================================================================
    #[error("Authentication with the middleware failed: {0}")]
    AuthenticationFailed(String),

    #[error("Failed to obtain an action plan: {0}")]
    PlanRequestFailed(String),

    #[error("Resource is not ready: {0}")]
    ResourceNotReady(String),

    #[error("Resource cleanup failed: {0}")]
    CleanupFailed(String),

    // =========================================================================
    // NetApp Connection Errors
    // =========================================================================
    #[error("Failed to connect to the network application: {0}")]
    ConnectFailed(String),

    #[error("Network application rejected initialization: {0}")]
    InitializeFailed(String),

    #[error("Not connected to the network application")]
    NotConnected,

    #[error("No result received for control command within {0:?}")]
    CommandTimeout(std::time::Duration),

    #[error("Data channel queue is full")]
    BackPressure,

    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Check if this error is transient (worth retrying at the same stage)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ConnectFailed(_) | Error::BackPressure | Error::CommandTimeout(_)
        )
    }

    /// Check if this error must trigger compensating resource deletion
    /// when it occurs after a plan was obtained
    pub fn requires_cleanup(&self) -> bool {
        !matches!(self, Error::CleanupFailed(_))
    }
}

/// Result type alias for the client
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(Error::ConnectFailed("refused".into()).is_transient());
        assert!(Error::BackPressure.is_transient());
        assert!(!Error::AuthenticationFailed("bad password".into()).is_transient());
        assert!(!Error::ResourceNotReady("timed out".into()).is_transient());
    }

    #[test]
    fn test_cleanup_never_compensates_itself() {
        assert!(!Error::CleanupFailed("gone".into()).requires_cleanup());
        assert!(Error::PlanRequestFailed("500".into()).requires_cleanup());
        assert!(Error::InitializeFailed("bad args".into()).requires_cleanup());
    }

    #[test]
    fn test_display_carries_message() {
        let err = Error::PlanRequestFailed("response 500: x".into());
        assert!(err.to_string().contains("response 500: x"));
    }
}
