//! Channel-specific error types.

use std::time::Duration;

use thiserror::Error;

use super::protocol::CommandKind;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors surfaced by the command channel.
///
/// `Clone` so that one bootstrap outcome can be handed to every caller that
/// joined a coalesced `initialize`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// Operation attempted before the channel reached `Ready`.
    #[error("command channel is not initialized")]
    NotInitialized,

    /// No terminal response arrived within the command's budget.
    #[error("{kind} timed out after {after:?}")]
    Timeout {
        /// Command that timed out.
        kind: CommandKind,
        /// Budget that was exceeded.
        after: Duration,
    },

    /// The worker context failed; every in-flight command is invalidated.
    #[error("worker failed: {0}")]
    WorkerFatal(String),

    /// The worker answered a specific command with ERROR.
    #[error("{kind} failed: {message}")]
    CommandFailed {
        /// Command that failed.
        kind: CommandKind,
        /// Error message from the worker.
        message: String,
    },

    /// Operation attempted, or forcibly settled, after teardown.
    #[error("command channel disposed")]
    Disposed,

    /// The worker context could not be started.
    #[error("failed to start worker: {0}")]
    SpawnFailed(String),

    /// The transport refused an outgoing command.
    #[error("failed to send command to worker: {0}")]
    SendFailed(String),

    /// Failed to serialize a command payload.
    #[error("failed to serialize command: {0}")]
    SerializeFailed(String),

    /// Failed to interpret a worker response.
    #[error("failed to deserialize worker response: {0}")]
    DeserializeFailed(String),

    /// Completion handle dropped without an outcome (internal error).
    #[error("response channel closed unexpectedly")]
    ChannelClosed,
}

impl ChannelError {
    /// Create a command failure from a worker ERROR message.
    pub fn command_failed(kind: CommandKind, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            kind,
            message: message.into(),
        }
    }

    /// Check if this error means the worker can no longer be trusted.
    pub fn is_worker_fatal(&self) -> bool {
        matches!(self, Self::WorkerFatal(_) | Self::ChannelClosed)
    }

    /// Check if this error is retriable. Nothing in the channel retries on
    /// its own; this is a hint for callers.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::WorkerFatal(_) | Self::ChannelClosed
        )
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        Self::DeserializeFailed(err.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ChannelError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}
