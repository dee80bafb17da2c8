//! Sticky per-generation fatal error.

use std::sync::OnceLock;

/// Unrecoverable error that poisons a generation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalError {
    /// The worker sent something that does not follow the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("connection error: {0}")]
    Io(String),

    /// The caller's message handler failed (or none was supplied).
    #[error("message handler error: {0}")]
    Handler(String),

    #[error("jsockd process exited unexpectedly ({0})")]
    UnexpectedExit(String),
}

/// First-writer-wins cell shared by everything in one generation.
#[derive(Debug, Default)]
pub struct FatalLatch {
    cell: OnceLock<FatalError>,
}

impl FatalLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch `error` unless something was latched before.
    ///
    /// Returns true if this call set the latch.
    pub fn set(&self, error: FatalError) -> bool {
        let won = self.cell.set(error.clone()).is_ok();
        if won {
            tracing::error!(error = %error, "Generation poisoned");
        } else {
            tracing::debug!(error = %error, "Ignoring fatal error, generation already poisoned");
        }
        won
    }

    pub fn get(&self) -> Option<FatalError> {
        self.cell.get().cloned()
    }

    pub fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }
}
