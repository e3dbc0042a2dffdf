//! Domain error model.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Failure raised by a domain type.
///
/// Only deterministic business outcomes live here. Locking, storage and
/// tenant checks are the ledger's concern and have their own error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Rejected input: non-positive quantity, negative cost, blank SKU.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The change would break a rule of the aggregate, such as a status move
    /// the transition table forbids.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The row changed since it was read.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Whether re-reading the row and trying again could succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_detail() {
        let err = DomainError::validation("quantity must be positive");
        assert_eq!(err.to_string(), "validation failed: quantity must be positive");
        assert!(!err.is_conflict());
        assert!(DomainError::conflict("stale").is_conflict());
    }
}
