//! In-memory doubles for the runner seams.
//!
//! Available in unit tests and, behind the `testing` feature, to downstream
//! crates' test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cnap_core::{ChatMessage, RunnerStatus, TaskId};
use tokio::sync::Notify;

use crate::backend::{ExecutionBackend, RunnerConfig};
use crate::error::{BackendError, InvokeError, ObserverError, RunnerError};
use crate::invoker::ModelInvoker;
use crate::observer::{RunResult, RunnerObserver, StatusCallback};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted invoker reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(String),
    /// Never resolves; only cancellation ends the call.
    Hang,
    /// Replies with the text once the gate is notified.
    Gated(Arc<Notify>, String),
}

/// Invoker that plays back queued replies, then a default one.
#[derive(Debug)]
pub struct ScriptedInvoker {
    queued: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    calls: Mutex<Vec<(String, Vec<ChatMessage>)>>,
}

impl ScriptedInvoker {
    pub fn replying(text: impl Into<String>) -> Arc<Self> {
        Self::with_fallback(Reply::Text(text.into()))
    }

    pub fn with_fallback(fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            queued: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Queue a one-shot reply ahead of the fallback.
    pub fn push(&self, reply: Reply) {
        lock(&self.queued).push_back(reply);
    }

    /// Every (model, conversation) pair received so far.
    pub fn calls(&self) -> Vec<(String, Vec<ChatMessage>)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ModelInvoker for ScriptedInvoker {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String, InvokeError> {
        lock(&self.calls).push((model.to_string(), messages.to_vec()));
        let reply = lock(&self.queued)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Fail(message) => Err(InvokeError::Other(message)),
            Reply::Hang => std::future::pending().await,
            Reply::Gated(gate, text) => {
                gate.notified().await;
                Ok(text)
            }
        }
    }
}

#[derive(Debug, Clone)]
enum StartBehavior {
    Succeed,
    Fail(String),
    Hang,
}

#[derive(Debug)]
struct BackendState {
    start: StartBehavior,
    started_with: Mutex<Option<RunnerConfig>>,
    status: Mutex<Result<RunnerStatus, String>>,
    sent: Mutex<Vec<ChatMessage>>,
    fail_sends: AtomicBool,
    stopped: AtomicBool,
    status_calls: AtomicUsize,
}

/// Backend whose behaviour is set by the test. Clones share state, so a test
/// can keep one handle after boxing another into a runner.
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    state: Arc<BackendState>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::with_start(StartBehavior::Succeed)
    }

    pub fn failing_start(message: impl Into<String>) -> Self {
        Self::with_start(StartBehavior::Fail(message.into()))
    }

    /// Start blocks until the caller cancels.
    pub fn hanging_start() -> Self {
        Self::with_start(StartBehavior::Hang)
    }

    fn with_start(start: StartBehavior) -> Self {
        Self {
            state: Arc::new(BackendState {
                start,
                started_with: Mutex::new(None),
                status: Mutex::new(Ok(RunnerStatus::Pending)),
                sent: Mutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                status_calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_status(&self, status: RunnerStatus) {
        *lock(&self.state.status) = Ok(status);
    }

    /// Make subsequent status polls fail.
    pub fn fail_status(&self, message: impl Into<String>) {
        *lock(&self.state.status) = Err(message.into());
    }

    /// Make subsequent sends fail.
    pub fn fail_sends(&self) {
        self.state.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn started_with(&self) -> Option<RunnerConfig> {
        lock(&self.state.started_with).clone()
    }

    pub fn sent(&self) -> Vec<ChatMessage> {
        lock(&self.state.sent).clone()
    }

    pub fn was_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.state.status_calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    async fn start(&self, config: &RunnerConfig) -> Result<(), BackendError> {
        match &self.state.start {
            StartBehavior::Succeed => {
                *lock(&self.state.started_with) = Some(config.clone());
                self.set_status(RunnerStatus::Running);
                Ok(())
            }
            StartBehavior::Fail(message) => Err(BackendError::Other(message.clone())),
            StartBehavior::Hang => std::future::pending().await,
        }
    }

    async fn send(&self, message: &ChatMessage) -> Result<(), BackendError> {
        if self.state.fail_sends.load(Ordering::SeqCst) {
            return Err(BackendError::Other("send rejected".to_string()));
        }
        lock(&self.state.sent).push(message.clone());
        Ok(())
    }

    async fn status(&self) -> Result<RunnerStatus, BackendError> {
        self.state.status_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.status).clone().map_err(BackendError::Other)
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.state.stopped.store(true, Ordering::SeqCst);
        self.set_status(RunnerStatus::Canceled);
        Ok(())
    }
}

/// Observer and callback that records everything it hears.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    statuses: Mutex<Vec<RunnerStatus>>,
    messages: Mutex<Vec<ChatMessage>>,
    completions: Mutex<Vec<RunResult>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn statuses(&self) -> Vec<RunnerStatus> {
        lock(&self.statuses).clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        lock(&self.messages).clone()
    }

    pub fn completions(&self) -> Vec<RunResult> {
        lock(&self.completions).clone()
    }

    /// Error messages, as displayed.
    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).clone()
    }
}

#[async_trait]
impl RunnerObserver for RecordingObserver {
    async fn on_status_change(
        &self,
        _task_id: &TaskId,
        status: RunnerStatus,
    ) -> Result<(), ObserverError> {
        lock(&self.statuses).push(status);
        Ok(())
    }

    async fn on_message(&self, _task_id: &TaskId, message: &ChatMessage) -> Result<(), ObserverError> {
        lock(&self.messages).push(message.clone());
        Ok(())
    }
}

#[async_trait]
impl StatusCallback for RecordingObserver {
    async fn on_status_change(
        &self,
        _task_id: &TaskId,
        status: RunnerStatus,
    ) -> Result<(), ObserverError> {
        lock(&self.statuses).push(status);
        Ok(())
    }

    async fn on_complete(&self, _task_id: &TaskId, result: &RunResult) -> Result<(), ObserverError> {
        lock(&self.completions).push(result.clone());
        Ok(())
    }

    async fn on_error(&self, _task_id: &TaskId, error: &RunnerError) -> Result<(), ObserverError> {
        lock(&self.errors).push(error.to_string());
        Ok(())
    }
}
