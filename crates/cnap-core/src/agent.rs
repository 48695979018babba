//! Agent records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, AgentStatus};

/// A named agent that tasks are created against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent name.
    pub agent_id: AgentId,

    /// Human-readable description.
    pub description: String,

    /// Model identifier passed to the model invoker.
    pub model: String,

    /// System prompt prepended to every invocation.
    pub prompt: String,

    pub status: AgentStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Create a new active Agent.
    pub fn new(agent_id: impl Into<AgentId>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            description: String::new(),
            model: model.into(),
            prompt: String::new(),
            status: AgentStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder method to set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Builder method to set the system prompt.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Whether the agent may own new tasks.
    pub fn is_available(&self) -> bool {
        self.status != AgentStatus::Deleted
    }
}
