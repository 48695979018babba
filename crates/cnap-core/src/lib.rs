//! CNAP Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Storage
//! - Runtime specifics
//!
//! Agents own Tasks, Tasks accumulate an append-only conversation, and
//! Runners drive a Task's execution through the [`RunnerStatus`] state machine.

pub mod agent;
pub mod chat;
pub mod error;
pub mod ids;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use agent::Agent;
pub use chat::{ChatMessage, ChatRole};
pub use error::CoreError;
pub use ids::{validate_identifier, AgentId, TaskId, MAX_IDENTIFIER_LEN};
pub use status::{AgentStatus, RunStepStatus, RunStepType, RunnerStatus, TaskStatus};
pub use task::{Checkpoint, MessageIndex, RunStep, Task};
