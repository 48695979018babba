//! Task, message index, run step, and checkpoint records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, ChatRole, RunStepStatus, RunStepType, TaskId, TaskStatus};

/// A Task represents one unit of agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Caller-assigned task identifier.
    pub task_id: TaskId,

    /// Agent that owns this task.
    pub agent_id: AgentId,

    /// Optional initial prompt, sent as the first user message.
    pub prompt: Option<String>,

    /// Current task status.
    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending Task.
    pub fn new(task_id: impl Into<TaskId>, agent_id: impl Into<AgentId>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            prompt: None,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder method to set the initial prompt. Blank prompts are dropped.
    pub fn with_prompt(mut self, prompt: Option<String>) -> Self {
        self.prompt = prompt.filter(|p| !p.trim().is_empty());
        self
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One row of a task's append-only conversation index.
///
/// Indices for a task are `0, 1, 2, ...` with no gaps; the content itself
/// lives out-of-band at `file_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageIndex {
    pub task_id: TaskId,
    pub conversation_index: u32,
    pub role: ChatRole,
    /// Location of the stored message content.
    pub file_path: String,
    pub updated_at: DateTime<Utc>,
}

/// A recorded execution step of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    pub task_id: TaskId,
    pub step_no: u32,
    pub step_type: RunStepType,
    pub status: RunStepStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunStep {
    pub fn new(task_id: TaskId, step_no: u32, step_type: RunStepType) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            step_no,
            step_type,
            status: RunStepStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: RunStepStatus) -> Self {
        self.status = status;
        self
    }
}

/// A workspace snapshot reference for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: TaskId,
    pub git_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(task_id: TaskId, git_hash: impl Into<String>) -> Self {
        Self {
            task_id,
            git_hash: git_hash.into(),
            created_at: Utc::now(),
        }
    }
}
