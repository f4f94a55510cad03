//! Logging helpers for results whose errors are handled by skipping.
//!
//! The escalation scheduler and post-commit side effects never propagate
//! some failures; these extensions make sure such failures are at least
//! recorded with the caller's location.

use std::fmt::Display;
use tracing::error;

pub trait ResultExt<T, E> {
    /// Log the error with context if this is an `Err` variant and return
    /// the result unchanged.
    ///
    /// ```ignore
    /// use workorder_engine::result_ext::ResultExt;
    ///
    /// let _ = scheduler.tick().await.log("escalation tick");
    /// ```
    fn log<S: ToString>(self, context: S) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let caller_location = std::panic::Location::caller();
            error!(
                target: "workorder_engine",
                error = %e,
                file = %format!("{}:{}", caller_location.file(), caller_location.line()),
                context = %context.to_string(),
                "Operation failed, continuing"
            );
        }
        self
    }
}

/// Same as [`ResultExt`] for values expected to be present.
pub trait OptionResultExt<T> {
    fn log_none<S: ToString>(self, context: S) -> Option<T>;
}

impl<T> OptionResultExt<T> for Option<T> {
    #[track_caller]
    fn log_none<S: ToString>(self, context: S) -> Option<T> {
        if self.is_none() {
            let caller_location = std::panic::Location::caller();
            tracing::warn!(
                target: "workorder_engine",
                file = %format!("{}:{}", caller_location.file(), caller_location.line()),
                context = %context.to_string(),
                "Expected value was None"
            );
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::EngineError;

    #[test]
    fn test_log_passes_results_through() {
        let ok: Result<u32, EngineError> = Ok(7);
        assert_eq!(ok.log("tick").unwrap(), 7);

        let err: Result<u32, EngineError> = Err(EngineError::Conflict("v2".to_string()));
        assert!(matches!(err.log("tick"), Err(EngineError::Conflict(_))));
    }

    #[test]
    fn test_log_none_passes_options_through() {
        assert_eq!(Some("review").log_none("step lookup"), Some("review"));
        assert_eq!(None::<&str>.log_none("step lookup"), None);
    }
}
