//! Task lifecycle coordination.
//!
//! The [`Coordinator`] turns durable agent/task/message records into runner
//! dispatches and mirrors runner outcomes back into the repository. Runners
//! never see the repository; results come back through a [`StatusCallback`]
//! wired in at dispatch time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cnap_core::{
    Agent, AgentId, AgentStatus, ChatMessage, ChatRole, Checkpoint, MessageIndex, RunStep,
    RunStepStatus, RunStepType, RunnerStatus, Task, TaskId, TaskStatus,
};
use cnap_runner::{
    AgentInfo, InvokeRequest, ObserverError, RunResult, RunnerError, RunnerRegistry,
    StatusCallback,
};

use crate::content::ContentStore;
use crate::error::{ControllerError, RepositoryError};
use crate::repository::Repository;

/// A task together with its conversation length.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub task: Task,
    pub message_count: u32,
}

/// Handle to a dispatched task's background execution.
#[derive(Debug)]
pub struct Dispatch {
    task_id: TaskId,
    handle: JoinHandle<Result<RunResult, RunnerError>>,
}

impl Dispatch {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Wait for the invocation to finish.
    ///
    /// By the time this returns, the task's terminal status and any reply
    /// have been persisted.
    pub async fn wait(self) -> Result<RunResult, ControllerError> {
        match self.handle.await {
            Ok(outcome) => outcome.map_err(ControllerError::from),
            Err(e) => {
                error!(task_id = %self.task_id, error = %e, "Dispatch task ended abnormally");
                Err(ControllerError::DispatchAborted(self.task_id))
            }
        }
    }
}

type InFlight = HashMap<TaskId, (u64, CancellationToken)>;

fn lock(in_flight: &Mutex<InFlight>) -> MutexGuard<'_, InFlight> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drop the in-flight entry if it still belongs to `dispatch_id`.
fn release(in_flight: &Mutex<InFlight>, task_id: &TaskId, dispatch_id: u64) {
    let mut guard = lock(in_flight);
    if guard.get(task_id).is_some_and(|(id, _)| *id == dispatch_id) {
        guard.remove(task_id);
    }
}

/// Task Lifecycle Coordinator.
pub struct Coordinator {
    repo: Arc<dyn Repository>,
    content: Arc<dyn ContentStore>,
    registry: Arc<RunnerRegistry>,
    in_flight: Arc<Mutex<InFlight>>,
    next_dispatch: AtomicU64,
    /// Serializes dispatch (status check until the task is marked running)
    /// with administrative status changes.
    dispatching: tokio::sync::Mutex<()>,
}

impl Coordinator {
    pub fn new(
        repo: Arc<dyn Repository>,
        content: Arc<dyn ContentStore>,
        registry: Arc<RunnerRegistry>,
    ) -> Self {
        Self {
            repo,
            content,
            registry,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_dispatch: AtomicU64::new(1),
            dispatching: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<RunnerRegistry> {
        &self.registry
    }

    /// Validate an agent identifier.
    pub fn validate_agent(agent_id: &str) -> Result<AgentId, ControllerError> {
        let id = AgentId::new(agent_id);
        id.validate()?;
        Ok(id)
    }

    /// Validate a task identifier.
    pub fn validate_task(task_id: &str) -> Result<TaskId, ControllerError> {
        let id = TaskId::new(task_id);
        id.validate()?;
        Ok(id)
    }

    // ---- Agents ----

    pub async fn create_agent(
        &self,
        agent_id: &str,
        description: &str,
        model: &str,
        prompt: &str,
    ) -> Result<Agent, ControllerError> {
        let agent_id = Self::validate_agent(agent_id)?;
        let agent = Agent::new(agent_id, model)
            .with_description(description)
            .with_prompt(prompt);

        self.repo.create_agent(agent.clone()).await?;
        info!(agent = %agent.agent_id, model = %agent.model, "Agent created");
        Ok(agent)
    }

    pub async fn get_agent_info(&self, agent_id: &str) -> Result<Agent, ControllerError> {
        let agent_id = Self::validate_agent(agent_id)?;
        self.load_agent(&agent_id).await
    }

    /// IDs of agents that have not been deleted.
    pub async fn list_agents(&self) -> Result<Vec<AgentId>, ControllerError> {
        Ok(self
            .list_agents_with_info()
            .await?
            .into_iter()
            .map(|a| a.agent_id)
            .collect())
    }

    /// Agents that have not been deleted, ordered by ID.
    pub async fn list_agents_with_info(&self) -> Result<Vec<Agent>, ControllerError> {
        let mut agents = self.repo.list_agents().await?;
        agents.retain(Agent::is_available);
        Ok(agents)
    }

    pub async fn update_agent(
        &self,
        agent_id: &str,
        description: &str,
        model: &str,
        prompt: &str,
    ) -> Result<Agent, ControllerError> {
        let agent_id = Self::validate_agent(agent_id)?;
        let agent = Agent::new(agent_id, model)
            .with_description(description)
            .with_prompt(prompt);

        let updated = self.repo.update_agent(agent).await?;
        info!(agent = %updated.agent_id, model = %updated.model, "Agent updated");
        Ok(updated)
    }

    /// Soft-delete an agent. Its tasks are kept.
    pub async fn delete_agent(&self, agent_id: &str) -> Result<(), ControllerError> {
        let agent_id = Self::validate_agent(agent_id)?;
        self.repo
            .upsert_agent_status(&agent_id, AgentStatus::Deleted)
            .await?;
        info!(agent = %agent_id, "Agent deleted");
        Ok(())
    }

    // ---- Tasks ----

    /// Create a pending task. Deleted agents count as absent.
    pub async fn create_task(
        &self,
        agent_id: &str,
        task_id: &str,
        prompt: Option<String>,
    ) -> Result<Task, ControllerError> {
        let agent_id = Self::validate_agent(agent_id)?;
        let task_id = Self::validate_task(task_id)?;

        let agent = self.load_agent(&agent_id).await?;
        if !agent.is_available() {
            return Err(ControllerError::AgentNotFound(agent_id));
        }

        let task = Task::new(task_id, agent_id).with_prompt(prompt);
        self.repo.create_task(task.clone()).await?;
        info!(
            task_id = %task.task_id,
            agent = %task.agent_id,
            has_prompt = task.prompt.is_some(),
            "Task created"
        );
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task, ControllerError> {
        let task_id = Self::validate_task(task_id)?;
        self.load_task(&task_id).await
    }

    pub async fn get_task_info(&self, task_id: &str) -> Result<TaskInfo, ControllerError> {
        let task_id = Self::validate_task(task_id)?;
        let task = self.load_task(&task_id).await?;
        let message_count = self.repo.next_conversation_index(&task_id).await?;
        Ok(TaskInfo {
            task,
            message_count,
        })
    }

    /// Tasks of an agent, oldest first.
    pub async fn list_tasks_by_agent(&self, agent_id: &str) -> Result<Vec<Task>, ControllerError> {
        let agent_id = Self::validate_agent(agent_id)?;
        self.load_agent(&agent_id).await?;
        Ok(self.repo.list_tasks_by_agent(&agent_id).await?)
    }

    // ---- Conversation ----

    /// Store a message and append it to the task's conversation.
    /// Does not dispatch.
    pub async fn add_message(
        &self,
        task_id: &str,
        role: ChatRole,
        content: &str,
    ) -> Result<MessageIndex, ControllerError> {
        let task_id = Self::validate_task(task_id)?;
        self.load_task(&task_id).await?;
        append_message(
            self.repo.as_ref(),
            self.content.as_ref(),
            &task_id,
            &ChatMessage::new(role, content),
        )
        .await
    }

    pub async fn list_message_index(
        &self,
        task_id: &str,
    ) -> Result<Vec<MessageIndex>, ControllerError> {
        let task_id = Self::validate_task(task_id)?;
        self.load_task(&task_id).await?;
        Ok(self.repo.list_message_index_by_task(&task_id).await?)
    }

    pub async fn next_conversation_index(&self, task_id: &str) -> Result<u32, ControllerError> {
        let task_id = Self::validate_task(task_id)?;
        self.load_task(&task_id).await?;
        Ok(self.repo.next_conversation_index(&task_id).await?)
    }

    /// The stored conversation, in order.
    pub async fn list_messages(&self, task_id: &str) -> Result<Vec<ChatMessage>, ControllerError> {
        let task_id = Self::validate_task(task_id)?;
        self.load_task(&task_id).await?;
        self.load_conversation(&task_id).await
    }

    // ---- Dispatch ----

    /// Dispatch a task: mark it running and invoke its agent's model in the
    /// background with the initial prompt followed by the stored messages.
    ///
    /// The returned [`Dispatch`] owns the background execution; dropping it
    /// does not cancel the run.
    pub async fn send_message(&self, task_id: &str) -> Result<Dispatch, ControllerError> {
        let task_id = Self::validate_task(task_id)?;
        let _dispatching = self.dispatching.lock().await;
        let task = self.load_task(&task_id).await?;
        match task.status {
            TaskStatus::Running => return Err(ControllerError::TaskAlreadyRunning(task_id)),
            status if status.is_terminal() => {
                return Err(ControllerError::TaskAlreadyFinished { task_id, status })
            }
            _ => {}
        }

        let mut messages = Vec::new();
        if let Some(prompt) = &task.prompt {
            messages.push(ChatMessage::user(prompt.clone()));
        }
        messages.extend(self.load_conversation(&task_id).await?);
        if messages.is_empty() {
            return Err(ControllerError::NothingToSend(task_id));
        }

        let agent = self.load_agent(&task.agent_id).await?;
        let step_no = self
            .repo
            .list_run_steps(&task_id)
            .await?
            .last()
            .map_or(0, |step| step.step_no + 1);

        let callback = Arc::new(TaskCallback {
            repo: Arc::clone(&self.repo),
            content: Arc::clone(&self.content),
            step_no,
        });
        let runner = match self
            .registry
            .create_runner(task_id.clone(), AgentInfo::from(&agent), Some(callback))
            .await
        {
            Ok(runner) => runner,
            Err(RunnerError::DuplicateRunner(id)) => {
                return Err(ControllerError::TaskAlreadyRunning(id))
            }
            Err(e) => return Err(e.into()),
        };

        let dispatch_id = self.next_dispatch.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        lock(&self.in_flight).insert(task_id.clone(), (dispatch_id, cancel.clone()));

        if let Err(e) = self.begin(&task_id, step_no).await {
            release(&self.in_flight, &task_id, dispatch_id);
            self.registry.delete_runner(&task_id).await;
            return Err(e);
        }

        info!(
            task_id = %task_id,
            agent = %agent.agent_id,
            model = %agent.model,
            step_no,
            messages = messages.len(),
            "Task dispatched"
        );

        let request = InvokeRequest::for_agent(runner.agent(), messages);
        let in_flight = Arc::clone(&self.in_flight);
        let bg_task_id = task_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = runner.invoke(request, &cancel).await;
            if let Err(e) = &outcome {
                if !e.is_canceled() {
                    if let Err(mark_err) = runner.mark_failed().await {
                        debug!(task_id = %bg_task_id, error = %mark_err, "Runner already finished");
                    }
                }
            }

            release(&in_flight, &bg_task_id, dispatch_id);
            outcome
        });

        Ok(Dispatch { task_id, handle })
    }

    /// Record the run step, then mark the task running. If the status write
    /// fails the step is marked failed and the task keeps its status.
    async fn begin(&self, task_id: &TaskId, step_no: u32) -> Result<(), ControllerError> {
        let step = RunStep::new(task_id.clone(), step_no, RunStepType::Model);
        self.repo
            .upsert_run_step(step.clone().with_status(RunStepStatus::Running))
            .await?;

        if let Err(e) = self
            .repo
            .transition_task_status(task_id, TaskStatus::Running)
            .await
        {
            if let Err(step_err) = self
                .repo
                .upsert_run_step(step.with_status(RunStepStatus::Failed))
                .await
            {
                warn!(task_id = %task_id, step_no, error = %step_err, "Failed to mark run step failed");
            }
            return Err(e.into());
        }
        Ok(())
    }

    // ---- Status ----

    /// Administrative status change. Moving out of a terminal status is
    /// rejected; use [`force_task_status`](Self::force_task_status) for that.
    /// Setting the current status again is a no-op.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<Task, ControllerError> {
        let task_id = Self::validate_task(task_id)?;
        let _dispatching = self.dispatching.lock().await;
        let task = self.repo.transition_task_status(&task_id, status).await?;
        info!(task_id = %task_id, status = %status, "Task status updated");
        self.after_status_change(&task_id, status);
        Ok(task)
    }

    /// Operator override: set the status regardless of the current one.
    pub async fn force_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<Task, ControllerError> {
        let task_id = Self::validate_task(task_id)?;
        let _dispatching = self.dispatching.lock().await;
        let task = self.load_task(&task_id).await?;
        warn!(task_id = %task_id, from = %task.status, to = %status, "Forcing task status");
        let task = self.repo.upsert_task_status(&task_id, status).await?;
        self.after_status_change(&task_id, status);
        Ok(task)
    }

    fn after_status_change(&self, task_id: &TaskId, status: TaskStatus) {
        if status != TaskStatus::Canceled {
            return;
        }
        let token = lock(&self.in_flight).remove(task_id).map(|(_, token)| token);
        if let Some(token) = token {
            info!(task_id = %task_id, "Canceling in-flight dispatch");
            token.cancel();
        }
    }

    // ---- Run steps & checkpoints ----

    pub async fn list_run_steps(&self, task_id: &str) -> Result<Vec<RunStep>, ControllerError> {
        let task_id = Self::validate_task(task_id)?;
        self.load_task(&task_id).await?;
        Ok(self.repo.list_run_steps(&task_id).await?)
    }

    pub async fn create_checkpoint(
        &self,
        task_id: &str,
        git_hash: &str,
    ) -> Result<Checkpoint, ControllerError> {
        let task_id = Self::validate_task(task_id)?;
        self.load_task(&task_id).await?;
        let checkpoint = self
            .repo
            .create_checkpoint(Checkpoint::new(task_id, git_hash))
            .await?;
        debug!(task_id = %checkpoint.task_id, git_hash = %checkpoint.git_hash, "Checkpoint recorded");
        Ok(checkpoint)
    }

    pub async fn list_checkpoints(&self, task_id: &str) -> Result<Vec<Checkpoint>, ControllerError> {
        let task_id = Self::validate_task(task_id)?;
        self.load_task(&task_id).await?;
        Ok(self.repo.list_checkpoints(&task_id).await?)
    }

    // ---- Helpers ----

    async fn load_agent(&self, agent_id: &AgentId) -> Result<Agent, ControllerError> {
        self.repo
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| ControllerError::AgentNotFound(agent_id.clone()))
    }

    async fn load_task(&self, task_id: &TaskId) -> Result<Task, ControllerError> {
        self.repo
            .get_task(task_id)
            .await?
            .ok_or_else(|| ControllerError::TaskNotFound(task_id.clone()))
    }

    async fn load_conversation(&self, task_id: &TaskId) -> Result<Vec<ChatMessage>, ControllerError> {
        let rows = self.repo.list_message_index_by_task(task_id).await?;
        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            messages.push(self.content.get(&row.file_path).await?);
        }
        Ok(messages)
    }
}

/// Content first, then the index row: a row never points at missing content.
async fn append_message(
    repo: &dyn Repository,
    content: &dyn ContentStore,
    task_id: &TaskId,
    message: &ChatMessage,
) -> Result<MessageIndex, ControllerError> {
    let location = content.put(task_id, message).await?;
    let row = repo
        .append_message_index(task_id, message.role, location)
        .await?;
    info!(
        task_id = %task_id,
        index = row.conversation_index,
        role = %row.role,
        "Message appended"
    );
    Ok(row)
}

/// Mirrors one dispatch's outcome into the repository.
struct TaskCallback {
    repo: Arc<dyn Repository>,
    content: Arc<dyn ContentStore>,
    step_no: u32,
}

impl TaskCallback {
    fn step(&self, task_id: &TaskId, status: RunStepStatus) -> RunStep {
        RunStep::new(task_id.clone(), self.step_no, RunStepType::Model).with_status(status)
    }

    /// Move the task to its final status unless it already finished
    /// elsewhere (e.g. canceled by an operator), then record the step.
    ///
    /// Returns whether this dispatch decided the task's status.
    async fn finish(
        &self,
        task_id: &TaskId,
        task_status: TaskStatus,
        step_status: RunStepStatus,
    ) -> Result<bool, ControllerError> {
        let decided = match self.repo.transition_task_status(task_id, task_status).await {
            Ok(_) => {
                info!(task_id = %task_id, status = %task_status, "Task finished");
                true
            }
            Err(RepositoryError::InvalidTransition { from, .. }) => {
                debug!(task_id = %task_id, status = %from, "Task already finished, keeping status");
                false
            }
            Err(e) => return Err(e.into()),
        };

        let step_status = if decided {
            step_status
        } else {
            RunStepStatus::Failed
        };
        self.repo
            .upsert_run_step(self.step(task_id, step_status))
            .await?;
        Ok(decided)
    }

    /// The task was completed but its reply could not be stored.
    async fn reply_lost(&self, task_id: &TaskId) -> Result<(), ControllerError> {
        self.repo
            .upsert_task_status(task_id, TaskStatus::Failed)
            .await?;
        self.repo
            .upsert_run_step(self.step(task_id, RunStepStatus::Failed))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StatusCallback for TaskCallback {
    async fn on_status_change(
        &self,
        task_id: &TaskId,
        status: RunnerStatus,
    ) -> Result<(), ObserverError> {
        // Terminal outcomes arrive through on_complete/on_error.
        debug!(task_id = %task_id, status = %status, "Runner status observed");
        Ok(())
    }

    async fn on_complete(&self, task_id: &TaskId, result: &RunResult) -> Result<(), ObserverError> {
        // Status first: replies are only appended to tasks this dispatch completed.
        let decided = self
            .finish(task_id, TaskStatus::Completed, RunStepStatus::Completed)
            .await
            .map_err(ObserverError::new)?;
        if !decided {
            info!(task_id = %task_id, "Discarding reply for finished task");
            return Ok(());
        }

        let reply = ChatMessage::assistant(result.output.clone());
        if let Err(e) = append_message(self.repo.as_ref(), self.content.as_ref(), task_id, &reply).await
        {
            error!(task_id = %task_id, error = %e, "Failed to persist model reply");
            if let Err(mark_err) = self.reply_lost(task_id).await {
                error!(task_id = %task_id, error = %mark_err, "Failed to mark task failed");
            }
            return Err(ObserverError::new(e));
        }
        Ok(())
    }

    async fn on_error(&self, task_id: &TaskId, err: &RunnerError) -> Result<(), ObserverError> {
        let status = if err.is_canceled() {
            TaskStatus::Canceled
        } else {
            TaskStatus::Failed
        };
        warn!(task_id = %task_id, error = %err, status = %status, "Dispatch failed");
        self.finish(task_id, status, RunStepStatus::Failed)
            .await
            .map(|_| ())
            .map_err(ObserverError::new)
    }
}
