//! Error types for runners, backends, and model invocation.

use std::fmt;

use cnap_core::{CoreError, TaskId};
use thiserror::Error;

/// Errors reported by an execution backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Backend configuration is unusable.
    #[error("Invalid backend configuration: {0}")]
    InvalidConfig(String),

    /// I/O failure talking to the backend process.
    #[error("Backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message could not be encoded for the backend.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation requires a started backend.
    #[error("Backend not started")]
    NotStarted,

    /// Start was called twice.
    #[error("Backend already started")]
    AlreadyStarted,

    /// Backend-reported failure.
    #[error("{0}")]
    Other(String),
}

/// Errors from a one-shot model invocation.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// Required credential is not configured.
    #[error("Missing required credential: {0} is not set")]
    MissingCredential(&'static str),

    /// Transport-level failure (connect, timeout, body read).
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint replied with a non-success status.
    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Reply body was not a valid completion response.
    #[error("Failed to parse response: {error} (body: {body})")]
    Parse { error: String, body: String },

    /// Endpoint replied with an error payload.
    #[error("API error: {kind} - {message}")]
    Api { kind: String, message: String },

    /// Any other invoker failure.
    #[error("{0}")]
    Other(String),
}

impl InvokeError {
    /// The upstream HTTP status, when the endpoint produced one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Error returned by an observer or callback. Logged, never propagated.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ObserverError(String);

impl ObserverError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self(message.to_string())
    }
}

/// Errors from runner and registry operations.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// A live runner already exists for the task.
    #[error("Runner already exists for task: {0}")]
    DuplicateRunner(TaskId),

    /// The execution backend failed to start.
    #[error("Backend start failed: {0}")]
    BackendStart(#[source] BackendError),

    /// The execution backend failed a send/status/stop call.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Operation requires an execution backend.
    #[error("Runner for task {0} has no execution backend")]
    NoBackend(TaskId),

    /// Model invocation failed.
    #[error("Model invocation failed: {0}")]
    Invoke(#[from] InvokeError),

    /// Conversation has no user message to use as the prompt.
    #[error("Conversation has no user message")]
    NoUserMessage,

    /// Operation was canceled by the caller.
    #[error("Operation canceled")]
    Canceled,

    /// Illegal state-machine transition.
    #[error(transparent)]
    Transition(#[from] CoreError),
}

impl RunnerError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}
