//! Per-task execution state machine.
//!
//! A [`Runner`] optionally wraps an [`ExecutionBackend`] and always holds a
//! [`ModelInvoker`]. Every status change goes through one transition path
//! that enforces [`RunnerStatus::can_transition_to`], suppresses no-op
//! changes, and fans the event out to observers in order.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use cnap_core::{Agent, AgentId, ChatMessage, ChatRole, CoreError, RunnerStatus, TaskId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{ExecutionBackend, RunnerConfig};
use crate::error::RunnerError;
use crate::invoker::{summarize_body, ModelInvoker};
use crate::observer::{deliver, RunResult, RunnerObserver, StatusCallback, SubscriptionId};

/// The agent a runner executes on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    /// Model identifier for invocations.
    pub model: String,
    /// System prompt for invocations.
    pub prompt: String,
}

impl AgentInfo {
    pub fn new(agent_id: impl Into<AgentId>, model: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            model: model.into(),
            prompt: String::new(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

impl From<&Agent> for AgentInfo {
    fn from(agent: &Agent) -> Self {
        Self {
            agent_id: agent.agent_id.clone(),
            model: agent.model.clone(),
            prompt: agent.prompt.clone(),
        }
    }
}

/// Inputs for one model invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeRequest {
    pub model: String,
    /// Prepended as a system message when non-empty.
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
}

impl InvokeRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            system_prompt: String::new(),
            messages,
        }
    }

    /// Request using the agent's model and system prompt.
    pub fn for_agent(agent: &AgentInfo, messages: Vec<ChatMessage>) -> Self {
        Self::new(agent.model.clone(), messages).with_system_prompt(agent.prompt.clone())
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// System prompt (if any) followed by the supplied messages.
    pub fn conversation(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        messages.extend(self.messages.iter().cloned());
        messages
    }
}

/// Content of the most recent user message.
pub fn effective_prompt(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User)
        .map(|m| m.content.as_str())
}

type ObserverList = Vec<(SubscriptionId, Arc<dyn RunnerObserver>)>;

/// Execution context for one task.
pub struct Runner {
    task_id: TaskId,
    agent: AgentInfo,
    status: Mutex<RunnerStatus>,
    backend: Option<Box<dyn ExecutionBackend>>,
    invoker: Arc<dyn ModelInvoker>,
    callback: Option<Arc<dyn StatusCallback>>,
    observers: RwLock<ObserverList>,
    next_subscription: AtomicU64,
    /// Serializes transitions with their deliveries so observers see events
    /// in the order they happened.
    delivery: tokio::sync::Mutex<()>,
}

impl Runner {
    /// Create a pending runner with no backend.
    pub fn new(task_id: TaskId, agent: AgentInfo, invoker: Arc<dyn ModelInvoker>) -> Self {
        Self {
            task_id,
            agent,
            status: Mutex::new(RunnerStatus::Pending),
            backend: None,
            invoker,
            callback: None,
            observers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            delivery: tokio::sync::Mutex::new(()),
        }
    }

    /// Builder method to attach an execution backend.
    pub fn with_backend(mut self, backend: Box<dyn ExecutionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Builder method to attach the completion callback.
    pub fn with_callback(mut self, callback: Option<Arc<dyn StatusCallback>>) -> Self {
        self.callback = callback;
        self
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn agent(&self) -> &AgentInfo {
        &self.agent
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Last recorded status.
    pub fn status(&self) -> RunnerStatus {
        *self.lock_status()
    }

    /// Register an observer for status and message events.
    pub fn subscribe(&self, observer: Arc<dyn RunnerObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    /// Start the execution backend, if one is attached.
    ///
    /// Without a backend the runner stays `Pending`, ready for a one-shot
    /// [`invoke`](Self::invoke).
    pub async fn start(
        &self,
        config: &RunnerConfig,
        cancel: &CancellationToken,
    ) -> Result<RunnerStatus, RunnerError> {
        let Some(backend) = self.backend.as_deref() else {
            debug!(task_id = %self.task_id, "No backend attached; runner stays pending");
            return Ok(self.status());
        };

        let current = self.status();
        if current != RunnerStatus::Pending {
            return Err(CoreError::InvalidStateTransition {
                from: current.to_string(),
                to: RunnerStatus::Running.to_string(),
            }
            .into());
        }

        info!(task_id = %self.task_id, image = %config.image, "Starting execution backend");
        match self.cancellable(cancel, backend.start(config)).await? {
            Ok(()) => {
                self.transition(RunnerStatus::Running).await?;
                Ok(RunnerStatus::Running)
            }
            Err(e) => {
                error!(task_id = %self.task_id, error = %e, "Backend start failed");
                self.settle(RunnerStatus::Failed).await;
                Err(RunnerError::BackendStart(e))
            }
        }
    }

    /// Call the model invoker exactly once with the request's conversation.
    ///
    /// A failed invocation is reported through the callback's error channel
    /// but leaves the runner's status alone; callers decide whether the task
    /// failed (see [`mark_failed`](Self::mark_failed)).
    pub async fn invoke(
        &self,
        request: InvokeRequest,
        cancel: &CancellationToken,
    ) -> Result<RunResult, RunnerError> {
        let messages = request.conversation();
        let Some(prompt) = effective_prompt(&messages).map(str::to_string) else {
            let err = RunnerError::NoUserMessage;
            self.report_error(&err).await;
            return Err(err);
        };

        if self.backend.is_none() {
            self.transition(RunnerStatus::Running).await?;
        }

        info!(
            task_id = %self.task_id,
            agent = %self.agent.agent_id,
            model = %request.model,
            messages = messages.len(),
            prompt_preview = %summarize_body(&prompt),
            "Invoking model"
        );

        let output = match self
            .cancellable(cancel, self.invoker.complete(&request.model, &messages))
            .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let err = RunnerError::Invoke(e);
                warn!(task_id = %self.task_id, error = %err, "Model invocation failed");
                self.report_error(&err).await;
                return Err(err);
            }
            Err(err) => {
                self.report_error(&err).await;
                return Err(err);
            }
        };

        let result = RunResult {
            task_id: self.task_id.clone(),
            agent_id: self.agent.agent_id.clone(),
            model: request.model,
            prompt,
            output,
        };

        if self.backend.is_none() {
            self.settle(RunnerStatus::Completed).await;
        }

        if let Some(callback) = &self.callback {
            let _ordered = self.delivery.lock().await;
            deliver(
                &self.task_id,
                "on_complete",
                callback.on_complete(&self.task_id, &result),
            )
            .await;
        }

        Ok(result)
    }

    /// Forward a message to the execution backend.
    pub async fn send_message(
        &self,
        message: &ChatMessage,
        cancel: &CancellationToken,
    ) -> Result<(), RunnerError> {
        let backend = self
            .backend
            .as_deref()
            .ok_or_else(|| RunnerError::NoBackend(self.task_id.clone()))?;

        match self.cancellable(cancel, backend.send(message)).await? {
            Ok(()) => {
                debug!(task_id = %self.task_id, role = %message.role, "Message sent to backend");
                self.notify_message(message).await;
                Ok(())
            }
            Err(e) => {
                error!(task_id = %self.task_id, error = %e, "Backend rejected message");
                self.settle(RunnerStatus::Failed).await;
                Err(RunnerError::Backend(e))
            }
        }
    }

    /// Poll the backend and record its status.
    ///
    /// Observers hear about a poll only when the status actually changed.
    /// An unreachable backend moves a running runner to `Unknown`.
    pub async fn check_status(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RunnerStatus, RunnerError> {
        let Some(backend) = self.backend.as_deref() else {
            return Ok(self.status());
        };

        let reported = match self.cancellable(cancel, backend.status()).await? {
            Ok(status) => status,
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Backend status unavailable");
                RunnerStatus::Unknown
            }
        };

        if let Err(e) = self.transition(reported).await {
            debug!(
                task_id = %self.task_id,
                reported = %reported,
                error = %e,
                "Ignoring reported backend status"
            );
        }
        Ok(self.status())
    }

    /// Stop the backend (if any) and resolve to `Canceled`.
    pub async fn stop(&self) -> Result<(), RunnerError> {
        if let Some(backend) = self.backend.as_deref() {
            backend.stop().await?;
        }
        self.settle(RunnerStatus::Canceled).await;
        Ok(())
    }

    /// Caller-triggered failure, e.g. after a failed invocation.
    pub async fn mark_failed(&self) -> Result<bool, RunnerError> {
        self.transition(RunnerStatus::Failed).await
    }

    /// Move to `next`, notifying observers. Returns false when `next` equals
    /// the current status.
    async fn transition(&self, next: RunnerStatus) -> Result<bool, RunnerError> {
        let _ordered = self.delivery.lock().await;

        let previous = {
            let mut status = self.lock_status();
            let current = *status;
            if current == next {
                return Ok(false);
            }
            if !current.can_transition_to(next) {
                return Err(CoreError::InvalidStateTransition {
                    from: current.to_string(),
                    to: next.to_string(),
                }
                .into());
            }
            *status = next;
            current
        };

        info!(task_id = %self.task_id, from = %previous, to = %next, "Runner status changed");

        for observer in self.snapshot_observers() {
            deliver(
                &self.task_id,
                "on_status_change",
                observer.on_status_change(&self.task_id, next),
            )
            .await;
        }
        if let Some(callback) = &self.callback {
            deliver(
                &self.task_id,
                "on_status_change",
                callback.on_status_change(&self.task_id, next),
            )
            .await;
        }
        Ok(true)
    }

    /// Transition on an internal failure path, where an illegal move only
    /// means a terminal state was already reached.
    async fn settle(&self, next: RunnerStatus) {
        if let Err(e) = self.transition(next).await {
            debug!(task_id = %self.task_id, error = %e, "Transition skipped");
        }
    }

    async fn notify_message(&self, message: &ChatMessage) {
        let _ordered = self.delivery.lock().await;
        for observer in self.snapshot_observers() {
            deliver(
                &self.task_id,
                "on_message",
                observer.on_message(&self.task_id, message),
            )
            .await;
        }
    }

    async fn report_error(&self, err: &RunnerError) {
        if let Some(callback) = &self.callback {
            let _ordered = self.delivery.lock().await;
            deliver(&self.task_id, "on_error", callback.on_error(&self.task_id, err)).await;
        }
    }

    /// Race `operation` against `cancel`. On cancellation the in-flight
    /// operation is dropped and the runner resolves to `Canceled` before the
    /// error is returned.
    async fn cancellable<F>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<F::Output, RunnerError>
    where
        F: Future,
    {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            output = operation => Some(output),
        };

        match outcome {
            Some(output) => Ok(output),
            None => {
                self.resolve_canceled().await;
                Err(RunnerError::Canceled)
            }
        }
    }

    async fn resolve_canceled(&self) {
        warn!(task_id = %self.task_id, status = %self.status(), "Operation canceled");
        if let Some(backend) = self.backend.as_deref() {
            if let Err(e) = backend.stop().await {
                debug!(task_id = %self.task_id, error = %e, "Backend stop after cancel failed");
            }
        }
        self.settle(RunnerStatus::Canceled).await;
    }

    fn snapshot_observers(&self) -> Vec<Arc<dyn RunnerObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }

    fn lock_status(&self) -> MutexGuard<'_, RunnerStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("task_id", &self.task_id)
            .field("agent", &self.agent.agent_id)
            .field("status", &self.status())
            .field("has_backend", &self.has_backend())
            .finish()
    }
}
