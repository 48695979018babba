//! Controller error types.

use std::path::PathBuf;

use cnap_core::{AgentId, CoreError, TaskId, TaskStatus};
use cnap_runner::RunnerError;
use thiserror::Error;

/// Errors from a [`Repository`](crate::Repository).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Agent already exists: {0}")]
    DuplicateAgent(AgentId),

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    /// Conditional status write refused by the stored status.
    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Underlying store failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Errors from a [`ContentStore`](crate::ContentStore).
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid stored message at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSON error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Task ID does not name a single directory under the store root.
    #[error("Task ID cannot be used as a directory name: {0}")]
    InvalidTaskDir(TaskId),
}

/// Errors surfaced by the [`Coordinator`](crate::Coordinator).
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Identifier failed validation.
    #[error(transparent)]
    Validation(CoreError),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Agent already exists: {0}")]
    DuplicateAgent(AgentId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("Task {0} is already running")]
    TaskAlreadyRunning(TaskId),

    #[error("Task {task_id} already finished ({status})")]
    TaskAlreadyFinished { task_id: TaskId, status: TaskStatus },

    #[error("Task {0} has no prompt or messages to send")]
    NothingToSend(TaskId),

    #[error("Invalid task status transition: {from} -> {to}")]
    InvalidStateTransition { from: TaskStatus, to: TaskStatus },

    #[error("Repository error: {0}")]
    Repository(RepositoryError),

    #[error("Content store error: {0}")]
    Content(#[from] ContentError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    /// The background dispatch ended without reporting (panicked or aborted).
    #[error("Dispatch for task {0} ended abnormally")]
    DispatchAborted(TaskId),
}

impl From<RepositoryError> for ControllerError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::AgentNotFound(id) => Self::AgentNotFound(id),
            RepositoryError::TaskNotFound(id) => Self::TaskNotFound(id),
            RepositoryError::DuplicateAgent(id) => Self::DuplicateAgent(id),
            RepositoryError::DuplicateTask(id) => Self::DuplicateTask(id),
            RepositoryError::InvalidTransition { from, to, .. } => {
                Self::InvalidStateTransition { from, to }
            }
            other => Self::Repository(other),
        }
    }
}

impl From<CoreError> for ControllerError {
    fn from(err: CoreError) -> Self {
        Self::Validation(err)
    }
}
