//! Error types for the sync engine.

use thiserror::Error;

/// Errors that can occur when talking to the sync engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// The engine task has exited; no further commands are accepted.
    #[error("Sync engine is not running")]
    EngineStopped,

    /// Command channel send error.
    #[error("Failed to send command to sync engine: {0}")]
    CommandSendError(String),

    /// A refresh was superseded by a session change before it completed.
    #[error("Refresh abandoned: session changed from generation {started} to {current}")]
    RefreshAbandoned { started: u64, current: u64 },

    /// The load started for a refresh failed. The engine keeps retrying on its own.
    #[error("Refresh failed: {reason}")]
    RefreshFailed { reason: String },

    /// A refresh was requested with no active session.
    #[error("No active session to refresh")]
    NoSession,
}

impl SyncError {
    /// Check if this error means the engine can no longer be reached.
    pub fn is_engine_stopped(&self) -> bool {
        matches!(self, SyncError::EngineStopped | SyncError::CommandSendError(_))
    }
}

impl From<SyncError> for crate::Error {
    fn from(err: SyncError) -> Self {
        crate::Error::Sync(err)
    }
}
