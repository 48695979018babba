//! Core domain errors.

use thiserror::Error;

/// Core domain errors for CNAP.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Identifier was empty.
    #[error("{kind} cannot be empty")]
    EmptyIdentifier { kind: &'static str },

    /// Identifier exceeded the maximum length.
    #[error("{kind} too long (max {max} characters)")]
    IdentifierTooLong { kind: &'static str, max: usize },

    /// Identifier contained a path separator, a control character, or was
    /// a relative path component.
    #[error("{kind} contains invalid characters: {value:?}")]
    InvalidIdentifier { kind: &'static str, value: String },

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Unrecognized status or role literal.
    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}
