//! Error types for ID and job key parsing.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs and job keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// A job key is not of the form `namespace/name`.
    #[error("invalid job key '{0}': expected 'namespace/name'")]
    InvalidKey(String),

    /// A namespace or name segment is not a valid label.
    #[error("invalid {field} '{value}': {reason}")]
    InvalidLabel {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error came from job key parsing.
    pub fn is_key_error(&self) -> bool {
        matches!(self, IdError::InvalidKey(_) | IdError::InvalidLabel { .. })
    }
}
