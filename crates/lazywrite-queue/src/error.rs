//! Queue error types.
//!
//! Every public API in this crate surfaces failures through
//! [`PersisterError`].  Failures of individual write items are *not* errors
//! of the queue: they are logged and counted by the worker (see
//! [`crate::queue`]).

/// Unified error type for the persistence queue.
#[derive(Debug, thiserror::Error)]
pub enum PersisterError {
    // -- Configuration ------------------------------------------------------
    /// A configuration value is out of range.
    #[error("invalid config `{field}`: {reason}")]
    InvalidConfig {
        /// Name of the offending field as it appears in the config file.
        field: &'static str,
        /// Human-readable description of the constraint that was violated.
        reason: String,
    },

    /// A configuration document could not be parsed.
    #[error("config parse error: {reason}")]
    ConfigParse { reason: String },

    /// Reading a configuration file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Worker lifecycle ---------------------------------------------------
    /// The OS refused to spawn the worker thread.
    #[error("failed to spawn worker thread: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },

    /// The operation needs a running worker and there is none.
    #[error("persister queue is not running")]
    NotRunning,

    /// A blocking operation was invoked from the worker thread itself, which
    /// would wait on its own progress forever.
    #[error("`{operation}` called from the worker thread")]
    WorkerReentrancy { operation: &'static str },

    /// The worker thread panicked outside of item processing.
    #[error("worker thread panicked")]
    WorkerPanicked,

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors.
    #[error("internal queue error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the queue crate.
pub type Result<T> = std::result::Result<T, PersisterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_display() {
        let err = PersisterError::InvalidConfig {
            field: "pre_task_delay_ms",
            reason: "must not be negative (got -1)".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid config `pre_task_delay_ms`: must not be negative (got -1)"
        );
    }

    #[test]
    fn reentrancy_display() {
        let err = PersisterError::WorkerReentrancy { operation: "flush" };
        assert_eq!(err.to_string(), "`flush` called from the worker thread");
    }

    #[test]
    fn spawn_error_keeps_source() {
        use std::error::Error as _;

        let err = PersisterError::Spawn {
            source: std::io::Error::new(std::io::ErrorKind::OutOfMemory, "no threads left"),
        };
        assert!(err.to_string().contains("no threads left"));
        assert!(err.source().is_some());
    }

    #[test]
    fn io_error_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "config gone");
        let err = PersisterError::from(io_err);
        assert!(matches!(err, PersisterError::Io(_)));
        assert!(err.to_string().contains("config gone"));
    }
}
