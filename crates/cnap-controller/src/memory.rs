//! In-process repository backed by `RwLock`ed maps.
//!
//! Lock order is agents, tasks, then the per-task tables.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use cnap_core::{
    Agent, AgentId, AgentStatus, ChatRole, Checkpoint, MessageIndex, RunStep, Task, TaskId,
    TaskStatus,
};

use crate::error::RepositoryError;
use crate::repository::Repository;

#[derive(Default)]
pub struct InMemoryRepository {
    agents: RwLock<HashMap<AgentId, Agent>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    messages: RwLock<HashMap<TaskId, Vec<MessageIndex>>>,
    run_steps: RwLock<HashMap<TaskId, BTreeMap<u32, RunStep>>>,
    checkpoints: RwLock<HashMap<TaskId, Vec<Checkpoint>>>,
}

impl InMemoryRepository {
    /// Create an empty repository wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn require_task(&self, task_id: &TaskId) -> Result<(), RepositoryError> {
        if self.tasks.read().await.contains_key(task_id) {
            Ok(())
        } else {
            Err(RepositoryError::TaskNotFound(task_id.clone()))
        }
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn create_agent(&self, agent: Agent) -> Result<(), RepositoryError> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&agent.agent_id) {
            return Err(RepositoryError::DuplicateAgent(agent.agent_id));
        }
        agents.insert(agent.agent_id.clone(), agent);
        Ok(())
    }

    async fn get_agent(&self, agent_id: &AgentId) -> Result<Option<Agent>, RepositoryError> {
        Ok(self.agents.read().await.get(agent_id).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, RepositoryError> {
        let mut agents: Vec<_> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }

    async fn update_agent(&self, agent: Agent) -> Result<Agent, RepositoryError> {
        let mut agents = self.agents.write().await;
        let stored = agents
            .get_mut(&agent.agent_id)
            .ok_or_else(|| RepositoryError::AgentNotFound(agent.agent_id.clone()))?;
        stored.description = agent.description;
        stored.model = agent.model;
        stored.prompt = agent.prompt;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn upsert_agent_status(
        &self,
        agent_id: &AgentId,
        status: AgentStatus,
    ) -> Result<(), RepositoryError> {
        let mut agents = self.agents.write().await;
        let stored = agents
            .get_mut(agent_id)
            .ok_or_else(|| RepositoryError::AgentNotFound(agent_id.clone()))?;
        stored.status = status;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn create_task(&self, task: Task) -> Result<(), RepositoryError> {
        let agents = self.agents.read().await;
        if !agents.contains_key(&task.agent_id) {
            return Err(RepositoryError::AgentNotFound(task.agent_id));
        }

        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.task_id) {
            return Err(RepositoryError::DuplicateTask(task.task_id));
        }
        tasks.insert(task.task_id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>, RepositoryError> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn list_tasks_by_agent(&self, agent_id: &AgentId) -> Result<Vec<Task>, RepositoryError> {
        let mut tasks: Vec<_> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| &t.agent_id == agent_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Ok(tasks)
    }

    async fn transition_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
    ) -> Result<Task, RepositoryError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| RepositoryError::TaskNotFound(task_id.clone()))?;
        if task.status == status {
            return Ok(task.clone());
        }
        if !task.status.can_transition_to(status) {
            return Err(RepositoryError::InvalidTransition {
                task_id: task_id.clone(),
                from: task.status,
                to: status,
            });
        }
        task.status = status;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn upsert_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
    ) -> Result<Task, RepositoryError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| RepositoryError::TaskNotFound(task_id.clone()))?;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn append_message_index(
        &self,
        task_id: &TaskId,
        role: ChatRole,
        file_path: String,
    ) -> Result<MessageIndex, RepositoryError> {
        self.require_task(task_id).await?;

        let mut messages = self.messages.write().await;
        let rows = messages.entry(task_id.clone()).or_default();
        let conversation_index = u32::try_from(rows.len())
            .map_err(|_| RepositoryError::Storage(format!("conversation for {task_id} is full")))?;

        let row = MessageIndex {
            task_id: task_id.clone(),
            conversation_index,
            role,
            file_path,
            updated_at: Utc::now(),
        };
        rows.push(row.clone());
        debug!(task_id = %task_id, index = conversation_index, role = %role, "Message index appended");
        Ok(row)
    }

    async fn list_message_index_by_task(
        &self,
        task_id: &TaskId,
    ) -> Result<Vec<MessageIndex>, RepositoryError> {
        Ok(self
            .messages
            .read()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn next_conversation_index(&self, task_id: &TaskId) -> Result<u32, RepositoryError> {
        let count = self.messages.read().await.get(task_id).map_or(0, Vec::len);
        u32::try_from(count)
            .map_err(|_| RepositoryError::Storage(format!("conversation for {task_id} is full")))
    }

    async fn upsert_run_step(&self, step: RunStep) -> Result<RunStep, RepositoryError> {
        self.require_task(&step.task_id).await?;

        let mut run_steps = self.run_steps.write().await;
        let steps = run_steps.entry(step.task_id.clone()).or_default();
        let stored = match steps.get_mut(&step.step_no) {
            Some(existing) => {
                existing.step_type = step.step_type;
                existing.status = step.status;
                existing.updated_at = Utc::now();
                existing.clone()
            }
            None => {
                steps.insert(step.step_no, step.clone());
                step
            }
        };
        Ok(stored)
    }

    async fn list_run_steps(&self, task_id: &TaskId) -> Result<Vec<RunStep>, RepositoryError> {
        Ok(self
            .run_steps
            .read()
            .await
            .get(task_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_checkpoint(
        &self,
        checkpoint: Checkpoint,
    ) -> Result<Checkpoint, RepositoryError> {
        self.require_task(&checkpoint.task_id).await?;

        let mut checkpoints = self.checkpoints.write().await;
        let rows = checkpoints.entry(checkpoint.task_id.clone()).or_default();
        if let Some(existing) = rows.iter().find(|c| c.git_hash == checkpoint.git_hash) {
            return Ok(existing.clone());
        }
        rows.push(checkpoint.clone());
        Ok(checkpoint)
    }

    async fn list_checkpoints(&self, task_id: &TaskId) -> Result<Vec<Checkpoint>, RepositoryError> {
        Ok(self
            .checkpoints
            .read()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }
}
