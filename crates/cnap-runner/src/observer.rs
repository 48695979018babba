//! Status/message propagation out of a runner.
//!
//! Runners never touch storage. Whoever owns persistence subscribes a
//! [`RunnerObserver`] or hands a [`StatusCallback`] to the registry and
//! mirrors events from there.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use cnap_core::{AgentId, ChatMessage, RunnerStatus, TaskId};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{ObserverError, RunnerError};

/// Outcome of a successful model invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    /// Model that produced the output.
    pub model: String,
    /// Effective prompt (latest user message).
    pub prompt: String,
    /// Generated text.
    pub output: String,
}

/// Subscriber to a runner's status and message events.
///
/// Events are delivered in transition order. Implementations must not drive
/// transitions on the same runner from inside a callback.
#[async_trait]
pub trait RunnerObserver: Send + Sync {
    async fn on_status_change(
        &self,
        task_id: &TaskId,
        status: RunnerStatus,
    ) -> Result<(), ObserverError>;

    async fn on_message(
        &self,
        _task_id: &TaskId,
        _message: &ChatMessage,
    ) -> Result<(), ObserverError> {
        Ok(())
    }
}

/// Completion contract handed to the registry when a runner is created.
#[async_trait]
pub trait StatusCallback: Send + Sync {
    async fn on_status_change(
        &self,
        _task_id: &TaskId,
        _status: RunnerStatus,
    ) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn on_complete(&self, task_id: &TaskId, result: &RunResult) -> Result<(), ObserverError>;

    async fn on_error(&self, task_id: &TaskId, error: &RunnerError) -> Result<(), ObserverError>;
}

/// Handle returned by `Runner::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

/// Await one observer delivery, logging errors and panics instead of
/// propagating them.
pub(crate) async fn deliver<F>(task_id: &TaskId, event: &'static str, delivery: F)
where
    F: Future<Output = Result<(), ObserverError>> + Send,
{
    match AssertUnwindSafe(delivery).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(task_id = %task_id, event, error = %e, "Observer returned an error");
        }
        Err(_) => {
            error!(task_id = %task_id, event, "Observer panicked");
        }
    }
}
