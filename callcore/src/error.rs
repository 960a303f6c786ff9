//! Call-related error types.

use thiserror::Error;

use crate::state::InvalidTransition;

/// Coarse classification every [`CallError`] falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unauthenticated,
    NotFound,
    Forbidden,
    Conflict,
    BadRequest,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("no resolved identity")]
    Unauthenticated,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated => ErrorKind::Unauthenticated,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Conflict(_) | Self::InvalidTransition(_) => ErrorKind::Conflict,
            Self::BadRequest(_) => ErrorKind::BadRequest,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}
