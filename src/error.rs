//! Error types for iac-runner operations.
//!
//! Defines error types for each subsystem:
//! - Entity parsing (task/step/variable enumerations)
//! - Secret decryption
//! - Workspace construction
//! - Step script rendering
//! - Task/step status transitions
//! - Container dispatch
//!
//! `RunError` aggregates all of them and classifies each failure into the
//! category that decides whether a step may be retried.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised when a persisted enumeration value is not recognised.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Unknown {kind} '{value}'")]
    UnknownValue { kind: &'static str, value: String },

    #[error("Duplicate variable '{name}' ({var_type}) in scope {scope}")]
    DuplicateVariable {
        scope: String,
        name: String,
        var_type: String,
    },

    #[error("Step indices are not contiguous: expected {expected}, found {found}")]
    NonContiguousIndex { expected: u32, found: u32 },
}

/// Errors that can occur while encrypting or decrypting secret values.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Secret key must not be empty")]
    EmptyKey,

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Sealed value is too short ({0} bytes)")]
    Truncated(usize),

    #[error("Secret integrity check failed")]
    TagMismatch,

    #[error("Failed to seal secret value")]
    SealFailed,

    #[error("Decrypted secret is not valid UTF-8")]
    InvalidUtf8,

    #[error("Failed to decrypt variable '{name}': {source}")]
    Variable {
        name: String,
        #[source]
        source: Box<SecretError>,
    },

    #[error("Failed to decrypt private key: {0}")]
    PrivateKey(#[source] Box<SecretError>),
}

/// Errors that can occur while building a task workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid workdir '{0}'")]
    InvalidWorkdir(String),

    #[error("Invalid policy id '{0}'")]
    InvalidPolicyId(String),

    #[error("Workspace '{0}' already exists")]
    AlreadyExists(String),

    #[error("Template rendering error: {0}")]
    Render(#[from] tera::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        WorkspaceError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Errors that can occur while rendering a step script.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("invalid workdir '{0}'")]
    InvalidWorkdir(String),

    #[error("Step '{step}' requires {field}")]
    MissingField { step: String, field: String },

    #[error("Template compilation failed: {0}")]
    Compile(#[source] tera::Error),

    #[error("Template '{name}' failed to render: {source}")]
    Render {
        name: String,
        #[source]
        source: tera::Error,
    },
}

/// Errors raised by the task and step state machines.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Invalid {entity} transition from '{from}' to '{to}'")]
    Illegal {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Task '{0}' has already exited")]
    TaskExited(String),

    #[error("Step {index} cannot be retried: {reason}")]
    RetryNotAllowed { index: u32, reason: String },

    #[error("Step {0} does not require approval")]
    ApprovalNotRequired(u32),

    #[error("Step {0} is waiting for approval")]
    ApprovalRequired(u32),

    #[error("Approver identity must not be empty")]
    EmptyApprover,
}

/// Errors that can occur while dispatching a step to the container runtime.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Container run failed: {0}")]
    RunFailed(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Invalid environment variable name '{0}'")]
    InvalidEnvName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure classes visible to the step lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input; surfaced immediately and never retried.
    Configuration,
    /// Decryption failure; aborts the run before the workspace is touched.
    Secret,
    /// Filesystem failure; the whole step may be re-run.
    Io,
    /// The step script or its container failed.
    Execution,
    /// The step exceeded its time budget.
    Timeout,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Secret => write!(f, "secret"),
            ErrorCategory::Io => write!(f, "io"),
            ErrorCategory::Execution => write!(f, "execution"),
            ErrorCategory::Timeout => write!(f, "timeout"),
        }
    }
}

/// Top-level error for a step run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Step {index} timed out after {seconds} seconds")]
    StepTimeout { index: u32, seconds: u64 },
}

impl RunError {
    /// Classifies the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            RunError::Config(_)
            | RunError::Model(_)
            | RunError::Script(_)
            | RunError::Transition(_) => ErrorCategory::Configuration,
            RunError::Secret(_) => ErrorCategory::Secret,
            RunError::Workspace(e) => match e {
                WorkspaceError::InvalidWorkdir(_)
                | WorkspaceError::InvalidPolicyId(_)
                | WorkspaceError::AlreadyExists(_)
                | WorkspaceError::Render(_) => ErrorCategory::Configuration,
                WorkspaceError::Yaml(_) | WorkspaceError::Json(_) | WorkspaceError::Io { .. } => {
                    ErrorCategory::Io
                }
            },
            RunError::Dispatch(DispatchError::InvalidEnvName(_)) => ErrorCategory::Configuration,
            RunError::Dispatch(_) => ErrorCategory::Execution,
            RunError::StepTimeout { .. } => ErrorCategory::Timeout,
        }
    }

    /// Returns whether re-running the whole step may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Io | ErrorCategory::Execution | ErrorCategory::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_workdir_is_configuration() {
        let err = RunError::from(WorkspaceError::InvalidWorkdir("../secrets".to_string()));
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("../secrets"));
    }

    #[test]
    fn test_secret_errors_are_not_retryable() {
        let err = RunError::from(SecretError::TagMismatch);
        assert_eq!(err.category(), ErrorCategory::Secret);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_io_and_timeout_are_retryable() {
        let io = RunError::from(WorkspaceError::Io {
            path: "/tmp/x".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        });
        assert_eq!(io.category(), ErrorCategory::Io);
        assert!(io.is_retryable());

        let timeout = RunError::StepTimeout {
            index: 2,
            seconds: 60,
        };
        assert_eq!(timeout.category(), ErrorCategory::Timeout);
        assert!(timeout.is_retryable());
    }

    #[test]
    fn test_dispatch_errors_are_execution() {
        let err = RunError::from(DispatchError::RunFailed("boom".to_string()));
        assert_eq!(err.category(), ErrorCategory::Execution);
        assert_eq!(err.category().to_string(), "execution");
    }
}
