use crate::types::{RunId, SessionId, UserId};
use crate::validator::RunValidationError;

/// Errors surfaced by the run pipeline.
///
/// Each variant maps to one HTTP status via [`RunboardError::status_code`];
/// the transport layer is expected to forward them unchanged.
#[derive(Debug, thiserror::Error)]
pub enum RunboardError {
    #[error("validation failed: {reason}")]
    Validation {
        reason: String,
        /// Stable replay/session validation code, when the failure came from
        /// run validation.
        code: Option<u16>,
    },

    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("persistence error: {reason}")]
    Persistence {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl RunboardError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
            code: None,
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn persistence(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Persistence {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn session_not_found(session_id: SessionId, user_id: UserId) -> Self {
        Self::not_found(format!("session {session_id} for user {user_id}"))
    }

    pub fn run_not_found(run_id: RunId) -> Self {
        Self::not_found(format!("run {run_id}"))
    }

    /// HTTP status code the transport layer should answer with.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::InvalidState { .. } => 400,
            Self::Forbidden { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::Config { .. } | Self::Persistence { .. } => 500,
        }
    }
}

impl From<RunValidationError> for RunboardError {
    fn from(err: RunValidationError) -> Self {
        Self::Validation {
            code: Some(err.code()),
            reason: err.to_string(),
        }
    }
}
