use std::fmt;

use df_db::models::{Backup, Instance};
use df_infra::ErrorCategory;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Instance,
    Backup,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Instance => "instance",
            Self::Backup => "backup",
        })
    }
}

/// Malformed input. Always raised before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Missing { field: &'static str },

    #[error("{field} must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("{field} must be between {min} and {max}")]
    OutOfRange {
        field: &'static str,
        min: i64,
        max: i64,
    },

    #[error("{field} must be one of: {allowed}")]
    NotInSet { field: &'static str, allowed: String },

    #[error("{field} contains disallowed characters")]
    DisallowedCharacters { field: &'static str },

    #[error("{field} must be at most {max} characters")]
    TooLong { field: &'static str, max: usize },
}

/// A requested change the lifecycle tables do not permit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("bad transition: {kind} cannot go from {from} to {to}")]
    BadTransition {
        kind: EntityKind,
        from: &'static str,
        to: &'static str,
    },

    #[error("{kind} is {status}; {operation} requires {required}")]
    NotAllowedIn {
        kind: EntityKind,
        status: &'static str,
        operation: &'static str,
        required: &'static str,
    },
}

/// Record state returned alongside a provider failure, so the caller can
/// inspect what was persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Record {
    Instance(Box<Instance>),
    Backup(Box<Backup>),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error("{kind} {id} belongs to another owner")]
    Forbidden { kind: EntityKind, id: Uuid },

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: Uuid },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("{kind} {id} changed concurrently, retry the request")]
    Conflict { kind: EntityKind, id: Uuid },

    #[error("provider error ({category}): {message}")]
    Provider {
        category: ErrorCategory,
        message: String,
        record: Option<Record>,
    },

    #[error("no compute provider configured for provider-managed {kind} {id}")]
    ProviderUnavailable { kind: EntityKind, id: Uuid },

    #[error("persistence error: {0}")]
    Persistence(#[from] df_db::Error),
}

impl Error {
    pub(crate) fn provider(err: &df_infra::Error, message: String, record: Option<Record>) -> Self {
        Self::Provider {
            category: err.category(),
            message,
            record,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
