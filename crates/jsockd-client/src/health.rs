//! Generation lifecycle and health reporting types.

use serde::{Deserialize, Serialize};

/// Lifecycle of one generation.
///
/// `Spawning → AwaitingReady → Connecting → Running → {ExitedClean | ExitedCrash}`.
/// A generation that fails during startup never reaches `Running` and is
/// discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationState {
    #[default]
    Spawning,
    /// Waiting for the READY line on stdout
    AwaitingReady,
    /// Dialing the announced sockets
    Connecting,
    /// Accepting commands
    Running,
    /// Process exited after a deliberate kill
    ExitedClean,
    /// Process exited on its own
    ExitedCrash,
}

impl GenerationState {
    pub fn is_exited(&self) -> bool {
        matches!(self, Self::ExitedClean | Self::ExitedCrash)
    }
}

/// Point-in-time view of a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Number of the current generation, starting at 1.
    pub generation: u64,
    pub state: GenerationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub connections: usize,
    /// Version reported by the current worker.
    pub jsockd_version: String,
    /// Latched fatal error of the current generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    /// Restarts performed within the trailing minute.
    pub restarts_in_window: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart_error: Option<String>,
    pub closed: bool,
}

impl HealthSnapshot {
    /// True if new commands can be expected to succeed.
    pub fn is_healthy(&self) -> bool {
        !self.closed && self.fatal_error.is_none() && self.state == GenerationState::Running
    }
}
