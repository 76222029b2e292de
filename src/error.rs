use thiserror::Error;

use crate::{content::ContentError, storage::StorageError};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("content is required")]
    EmptyContent,
    #[error("content must be between {min} and {max} words, got {count}")]
    WordCount { count: usize, min: usize, max: usize },
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Failures surfaced to callers of the story workflow.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("content conflict: {0}")]
    Conflict(String),
    #[error("content host failure: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for ServiceError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::StoryNotFound(_)
            | StorageError::UserNotFound(_)
            | StorageError::LanguageNotFound(_)
            | StorageError::GenreNotFound(_)
            | StorageError::CheckoutNotFound(_) => ServiceError::NotFound(e.to_string()),
            StorageError::StatusConflict { .. }
            | StorageError::CheckoutClosed(_)
            | StorageError::UserAlreadyExists(_) => ServiceError::InvalidState(e.to_string()),
            StorageError::Other(msg) => ServiceError::Internal(msg),
        }
    }
}

impl From<ContentError> for ServiceError {
    fn from(e: ContentError) -> Self {
        match e {
            ContentError::Conflict { .. } => ServiceError::Conflict(e.to_string()),
            ContentError::NotFound { .. } | ContentError::Upstream(_) => {
                ServiceError::Upstream(e.to_string())
            }
        }
    }
}

impl ServiceError {
    /// Short machine-readable kind, used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => "not_found",
            ServiceError::InvalidState(_) => "invalid_state",
            ServiceError::Forbidden(_) => "forbidden",
            ServiceError::Validation(_) => "validation",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::Upstream(_) => "upstream",
            ServiceError::Internal(_) => "internal",
        }
    }
}
