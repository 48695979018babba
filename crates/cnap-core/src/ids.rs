//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::CoreError;

/// Maximum length of a caller-assigned identifier.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Validate a caller-assigned identifier: non-empty, at most
/// [`MAX_IDENTIFIER_LEN`] characters, and usable as a single path component
/// (no `/`, `\`, control characters, `.` or `..`).
pub fn validate_identifier(kind: &'static str, value: &str) -> Result<(), CoreError> {
    if value.is_empty() {
        return Err(CoreError::EmptyIdentifier { kind });
    }
    if value.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(CoreError::IdentifierTooLong {
            kind,
            max: MAX_IDENTIFIER_LEN,
        });
    }
    if value == "."
        || value == ".."
        || value.chars().any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(CoreError::InvalidIdentifier {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Unique identifier for a Task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Create a new TaskId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random TaskId.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Check the identifier rule for task IDs.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_identifier("task ID", &self.0)
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Unique identifier for an Agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    /// Create a new AgentId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Check the identifier rule for agent names.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_identifier("agent name", &self.0)
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_generate() {
        let id1 = TaskId::generate();
        let id2 = TaskId::generate();
        assert_ne!(id1, id2);
        assert!(id1.validate().is_ok());
    }

    #[test]
    fn test_id_display() {
        let id = TaskId::new("test-123");
        assert_eq!(format!("{}", id), "test-123");
    }

    #[test]
    fn test_validate_identifier() {
        assert_eq!(
            TaskId::new("").validate(),
            Err(CoreError::EmptyIdentifier { kind: "task ID" })
        );
        assert!(AgentId::new("a".repeat(64)).validate().is_ok());
        assert!(matches!(
            AgentId::new("a".repeat(65)).validate(),
            Err(CoreError::IdentifierTooLong { max: 64, .. })
        ));
    }

    #[test]
    fn test_identifier_must_be_single_path_component() {
        for bad in ["../../escaped", "a/b", "a\\b", "..", ".", "tab\there"] {
            assert!(
                matches!(
                    TaskId::new(bad).validate(),
                    Err(CoreError::InvalidIdentifier { kind: "task ID", .. })
                ),
                "{bad:?} should be rejected"
            );
        }
        assert!(TaskId::new("task.v2..final").validate().is_ok());
        assert!(AgentId::new("agent-1_b").validate().is_ok());
    }
}
