//! Error types for logmon.
//!
//! Errors are strongly typed using thiserror so callers can tell a bad
//! configuration (fail fast, skip the spec) from a recoverable lookup miss
//! or an internal fault.

use thiserror::Error;

/// Validation errors raised before any resource is created.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        pattern: String,
        reason: String,
    },

    #[error("Invalid monitor tag '{tag}': {reason}")]
    InvalidTag {
        tag: String,
        reason: String,
    },

    #[error("Unknown aggregation kind '{kind}' (expected 'sum' or 'avg')")]
    UnknownAggregation {
        kind: String,
    },

    #[error("Duration '{field}' must be greater than zero")]
    ZeroDuration {
        field: String,
    },

    #[error("Capacity '{field}' must be greater than zero")]
    ZeroCapacity {
        field: String,
    },
}

/// Errors raised while operating live monitors.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Rule '{name}' already exists")]
    DuplicateRule {
        name: String,
    },

    #[error("Rule not found: {name}")]
    RuleNotFound {
        name: String,
    },

    #[error("Monitor for '{path}' is stopped")]
    MonitorStopped {
        path: String,
    },

    #[error("Failed to spawn worker '{name}': {message}")]
    Spawn {
        name: String,
        message: String,
    },

    #[error("Sink '{sink}' failed: {message}")]
    Sink {
        sink: String,
        message: String,
    },
}

/// Top-level error type for logmon.
#[derive(Debug, Error)]
pub enum LogmonError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Config error: {message}")]
    Config {
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl LogmonError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a config error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a lookup miss the caller can safely ignore.
    #[must_use]
    pub const fn is_lookup(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::RuleNotFound { .. }))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

/// Result type alias for logmon operations.
pub type LogmonResult<T> = Result<T, LogmonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_pattern() {
        let err = ValidationError::InvalidPattern {
            pattern: "(".to_string(),
            reason: "unclosed group".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("Invalid pattern '('"));
        assert!(msg.contains("unclosed group"));
    }

    #[test]
    fn test_execution_error_duplicate_rule() {
        let err = ExecutionError::DuplicateRule {
            name: "log.monitor--------x".to_string(),
        };
        assert!(format!("{err}").contains("already exists"));
    }

    #[test]
    fn test_lookup_error_is_recoverable() {
        let err: LogmonError = ExecutionError::RuleNotFound {
            name: "missing".to_string(),
        }
        .into();
        assert!(err.is_execution());
        assert!(err.is_lookup());
        assert!(!err.is_validation());
    }

    #[test]
    fn test_logmon_error_from_validation() {
        let err: LogmonError = ValidationError::UnknownAggregation {
            kind: "max".to_string(),
        }
        .into();
        assert!(err.is_validation());
        assert!(!err.is_lookup());
        assert!(format!("{err}").contains("'max'"));
    }

    #[test]
    fn test_logmon_error_internal() {
        let err = LogmonError::internal("poisoned lock: liveness");
        assert!(err.is_internal());
        assert!(format!("{err}").contains("poisoned lock"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: LogmonError = io.into();
        assert!(matches!(err, LogmonError::Io(_)));
    }
}
