//! Client error types.

use crate::controller::Lifecycle;
use thiserror::Error;

/// Errors returned by [`SyncController`](crate::SyncController).
///
/// Store and transport failures are not here: they surface as view state
/// (`error`, `connection_state`), never as returned errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A required identifier is missing; the start was deferred.
    #[error("Missing {0}, start deferred")]
    Config(&'static str),

    /// A start is already in progress.
    #[error("Start already in progress")]
    AlreadyInitializing,

    /// The operation needs a `Ready` controller.
    #[error("Controller is {0}, not ready")]
    NotReady(Lifecycle),

    /// The message was empty or whitespace only.
    #[error("Message content is empty")]
    EmptyMessage,

    /// `send` was called outside a Tokio runtime, so the write cannot run.
    #[error("No async runtime to run the write on")]
    NoRuntime,

    /// The configuration could not be parsed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] toml::de::Error),
}

/// Errors returned by [`ChatClient`](crate::ChatClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client task is gone.
    #[error("Client task has stopped")]
    Stopped,

    #[error(transparent)]
    Sync(#[from] SyncError),
}
