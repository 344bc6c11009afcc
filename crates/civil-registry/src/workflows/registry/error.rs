use serde::Serialize;

use super::domain::{EntityKind, UserId};
use super::repository::RepositoryError;

/// Coarse classification surfaced to callers alongside the detail message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidTransition,
    Validation,
    Conflict,
    Unauthorized,
    Forbidden,
    Storage,
}

/// Error raised by every registry operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{entity} {id} not found")]
    NotFound { entity: EntityKind, id: String },
    #[error("{entity} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: EntityKind,
        from: &'static str,
        to: &'static str,
    },
    #[error("{entity} cannot move to {to}: {reason}")]
    GuardRejected {
        entity: EntityKind,
        to: &'static str,
        reason: String,
    },
    #[error("missing or invalid fields: {}", fields.join(", "))]
    Validation { fields: Vec<&'static str> },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("ticket numbers exhausted for {partition}")]
    SequenceExhausted { partition: String },
    #[error("an authenticated actor is required")]
    Unauthorized,
    #[error("actor {user} is forbidden: {reason}")]
    Forbidden { user: UserId, reason: String },
    #[error("registry storage unavailable: {0}")]
    Storage(String),
}

impl RegistryError {
    pub fn not_found(entity: EntityKind, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidTransition { .. } | Self::GuardRejected { .. } => {
                ErrorKind::InvalidTransition
            }
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Conflict(_) | Self::SequenceExhausted { .. } => ErrorKind::Conflict,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Offending field names for validation failures; empty otherwise.
    pub fn fields(&self) -> &[&'static str] {
        match self {
            Self::Validation { fields } => fields,
            _ => &[],
        }
    }
}

impl From<RepositoryError> for RegistryError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Conflict(detail) => Self::Conflict(detail),
            RepositoryError::NotFound { entity, id } => Self::NotFound { entity, id },
            RepositoryError::Unavailable(detail) => Self::Storage(detail),
        }
    }
}
