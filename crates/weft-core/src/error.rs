//! Unified error types for Weft

use thiserror::Error;

/// Unified error type for all Weft operations
#[derive(Error, Debug)]
pub enum WeftError {
    // Plan errors (fatal, raised before any task runs)
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Step {step} depends on unknown step {dependency}")]
    MissingDependency { step: String, dependency: String },

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    // Task errors (contained to the task and its dependents)
    #[error("Invalid transition for {step}: {from} -> {to}")]
    InvalidTransition {
        step: String,
        from: String,
        to: String,
    },

    #[error("Timed out waiting for a {category} slot for step {step}")]
    AssignmentTimeout { step: String, category: String },

    #[error("Task {step} failed: {message}")]
    TaskExecution { step: String, message: String },

    // Memory errors
    #[error("Memory write failed: {0}")]
    MemoryWrite(String),

    #[error("Index corruption: {0}")]
    IndexCorruption(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // Configuration / persistence
    #[error("Config error: {0}")]
    Config(String),

    #[error("Task list error: {0}")]
    TaskList(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl WeftError {
    /// Plan-level errors abort a submission before any task is admitted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Cycle { .. }
                | Self::MissingDependency { .. }
                | Self::DuplicateStep(_)
                | Self::InvalidPlan(_)
        )
    }
}

/// Result type alias using WeftError
pub type Result<T> = std::result::Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_shows_path() {
        let err = WeftError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_task_errors_are_not_fatal() {
        let err = WeftError::AssignmentTimeout {
            step: "build".into(),
            category: "cpu".into(),
        };
        assert!(!err.is_fatal());
        assert!(!WeftError::MemoryWrite("disk full".into()).is_fatal());
    }
}
