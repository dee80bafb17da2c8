//! Caller-facing error types.

use std::time::Duration;

use crate::bridge::protocol::CommandId;
use crate::config::ConfigError;
use crate::latch::FatalError;
use crate::orchestrator::StartupError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to start jsockd: {0}")]
    Startup(#[from] StartupError),

    /// The generation is poisoned; every submission fails with this until a
    /// restart replaces it.
    #[error(transparent)]
    Fatal(#[from] FatalError),

    /// The generation is poisoned and its replacement failed to start. No
    /// further restart is attempted.
    #[error("{fatal}; restart failed: {restart_error}")]
    RestartFailed {
        fatal: FatalError,
        restart_error: String,
    },

    #[error("command {id} timed out after {timeout:?}")]
    Timeout { id: CommandId, timeout: Duration },

    #[error("no connections available")]
    NoConnections,

    /// The connection stopped without latching an error, e.g. during close.
    #[error("connection closed before the command completed")]
    ConnectionClosed,

    #[error("client is closed")]
    Closed,

    #[error("invalid command: {0}")]
    InvalidCommand(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The query threw. Carries the serialized exception.
    #[error("query raised an exception: {0}")]
    Exception(String),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The latched error, if this failure came from a poisoned generation.
    pub fn fatal(&self) -> Option<&FatalError> {
        match self {
            Self::Fatal(e) | Self::RestartFailed { fatal: e, .. } => Some(e),
            _ => None,
        }
    }
}

/// Outcome of `close`. Cloneable so repeated calls can return it again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloseError {
    #[error("failed to signal jsockd process: {0}")]
    Signal(String),

    #[error("failed waiting for jsockd process: {0}")]
    Wait(String),

    #[error("jsockd process still running {0:?} after SIGKILL")]
    ExitTimeout(Duration),

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        let err = ClientError::from(FatalError::Handler("nope".to_string()));
        assert_eq!(err.to_string(), "message handler error: nope");
        assert!(err.fatal().is_some());

        let err = ClientError::from(ConfigError::NotConfigured);
        assert!(err.to_string().starts_with("invalid configuration: "));
        assert!(err.fatal().is_none());

        let err = ClientError::RestartFailed {
            fatal: FatalError::UnexpectedExit("exit status: 3".to_string()),
            restart_error: "jsockd closed stdout before READY".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "jsockd process exited unexpectedly (exit status: 3); restart failed: jsockd closed stdout before READY"
        );
        assert!(matches!(err.fatal(), Some(FatalError::UnexpectedExit(_))));

        let err = CloseError::from(FatalError::UnexpectedExit("exit status: 3".to_string()));
        assert_eq!(
            err.to_string(),
            "jsockd process exited unexpectedly (exit status: 3)"
        );
    }
}
