//! Persistence contract consumed by the coordinator.

use async_trait::async_trait;
use cnap_core::{
    Agent, AgentId, AgentStatus, ChatRole, Checkpoint, MessageIndex, RunStep, Task, TaskId,
    TaskStatus,
};

use crate::error::RepositoryError;

/// Durable store for agent, task, message-index, run-step, and checkpoint
/// records.
///
/// Implementations must make [`append_message_index`](Self::append_message_index)
/// a single atomic allocate-and-append: the index it assigns is always the
/// number of rows already stored for the task.
#[async_trait]
pub trait Repository: Send + Sync {
    // Agents

    async fn create_agent(&self, agent: Agent) -> Result<(), RepositoryError>;

    async fn get_agent(&self, agent_id: &AgentId) -> Result<Option<Agent>, RepositoryError>;

    /// All agents, ordered by ID.
    async fn list_agents(&self) -> Result<Vec<Agent>, RepositoryError>;

    /// Replace description, model, and prompt. Status and creation time are
    /// kept.
    async fn update_agent(&self, agent: Agent) -> Result<Agent, RepositoryError>;

    async fn upsert_agent_status(
        &self,
        agent_id: &AgentId,
        status: AgentStatus,
    ) -> Result<(), RepositoryError>;

    // Tasks

    /// Insert a task. The owning agent must exist.
    async fn create_task(&self, task: Task) -> Result<(), RepositoryError>;

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>, RepositoryError>;

    /// Tasks owned by an agent, ordered by creation.
    async fn list_tasks_by_agent(&self, agent_id: &AgentId) -> Result<Vec<Task>, RepositoryError>;

    /// Move a task to `status` if its stored status allows it, checking and
    /// writing atomically.
    ///
    /// Setting the current status again returns the task unchanged. Leaving a
    /// terminal status fails with [`RepositoryError::InvalidTransition`].
    async fn transition_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
    ) -> Result<Task, RepositoryError>;

    /// Overwrite a task's status and bump its update time.
    async fn upsert_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
    ) -> Result<Task, RepositoryError>;

    // Conversation index

    /// Append the next index row for a task.
    async fn append_message_index(
        &self,
        task_id: &TaskId,
        role: ChatRole,
        file_path: String,
    ) -> Result<MessageIndex, RepositoryError>;

    /// Index rows for a task, in conversation order.
    async fn list_message_index_by_task(
        &self,
        task_id: &TaskId,
    ) -> Result<Vec<MessageIndex>, RepositoryError>;

    /// Index the next append will receive; equals the current row count.
    async fn next_conversation_index(&self, task_id: &TaskId) -> Result<u32, RepositoryError>;

    // Run steps and checkpoints

    /// Insert or update the step keyed by (task, step number).
    async fn upsert_run_step(&self, step: RunStep) -> Result<RunStep, RepositoryError>;

    /// Steps for a task, ordered by step number.
    async fn list_run_steps(&self, task_id: &TaskId) -> Result<Vec<RunStep>, RepositoryError>;

    /// Record a checkpoint. Returns the existing row if (task, hash) is
    /// already recorded.
    async fn create_checkpoint(&self, checkpoint: Checkpoint)
        -> Result<Checkpoint, RepositoryError>;

    async fn list_checkpoints(&self, task_id: &TaskId) -> Result<Vec<Checkpoint>, RepositoryError>;
}
