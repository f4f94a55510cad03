//! SQL queries, one module per table.
//!
//! Rows are read into `FromRow` structs and converted into the engine's
//! models here, so nothing outside this module sees column encodings.

pub mod comment;
pub mod definition;
pub mod escalation;
pub mod flow;
pub mod instance;

/// Statuses of instances that no longer accept actions.
pub(crate) const TERMINAL_STATUSES: &str = "('completed', 'cancelled', 'rejected')";

pub(crate) fn decode_err(what: &str, err: impl std::fmt::Display) -> crate::error::EngineError {
    crate::error::EngineError::Internal(format!("corrupt {} row: {}", what, err))
}
