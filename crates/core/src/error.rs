//! Errors raised while constructing core values.

use thiserror::Error;

/// A value that cannot exist: an identifier that does not parse, or a status
/// string outside a table's vocabulary.
///
/// Always deterministic. Retrying the same input fails the same way.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Text outside a closed vocabulary, e.g. a status column holding `"runing"`.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
