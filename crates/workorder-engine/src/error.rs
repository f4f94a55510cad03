//! Error types for the work-order engine.
//!
//! Every engine operation returns [`EngineResult`]. The first six variants
//! form the caller-facing taxonomy; the rest wrap collaborator failures.

use thiserror::Error;

use crate::definition::GraphError;

/// Engine-level errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Disallowed action, missing comment, bad input or runaway auto-advance.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Definition rejected at publish time.
    #[error("Invalid definition: {}", join_graph_errors(.0))]
    InvalidDefinition(Vec<GraphError>),

    /// Unknown instance, definition or comment parent.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Optimistic version check failed.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Actor is not an authorized assignee.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Action attempted on a completed, cancelled or rejected instance.
    #[error("Instance is terminal: {0}")]
    TerminalState(String),

    /// External call exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Directory collaborator failure
    #[error("Directory error: {0}")]
    Directory(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Parse error (YAML, JSON)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// NATS messaging error
    #[error("NATS error: {0}")]
    Nats(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by callers that map errors onto a wire status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Permission,
    TerminalState,
    Unavailable,
    Internal,
}

impl EngineError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_)
            | EngineError::InvalidDefinition(_)
            | EngineError::Parse(_) => ErrorKind::Validation,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Permission(_) => ErrorKind::Permission,
            EngineError::TerminalState(_) => ErrorKind::TerminalState,
            EngineError::Timeout(_) | EngineError::Directory(_) | EngineError::Nats(_) => {
                ErrorKind::Unavailable
            }
            EngineError::Database(_)
            | EngineError::Serialization(_)
            | EngineError::Config(_)
            | EngineError::Internal(_) => ErrorKind::Internal,
        }
    }
}

fn join_graph_errors(errors: &[GraphError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<envy::Error> for EngineError {
    fn from(err: envy::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Parse(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for EngineError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        EngineError::Timeout(err.to_string())
    }
}
