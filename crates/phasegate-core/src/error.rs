use thiserror::Error;

/// A convenience `Result` alias using [`PhasegateError`].
pub type PhasegateResult<T> = Result<T, PhasegateError>;

/// Top-level error type for the Phasegate orchestrator.
///
/// Variants follow the failure taxonomy the scheduler acts on: configuration
/// errors are fatal and never retried, execution errors and lock timeouts are
/// retried under the phase policy, the rest surface to the caller as-is.
#[derive(Error, Debug)]
pub enum PhasegateError {
    /// Malformed pipeline definition, unknown agent or capability mismatch.
    #[error("Config error: {0}")]
    Config(String),

    /// Agent unreachable, timed out, or produced malformed output.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Required artifact locks could not be acquired within the bounded wait.
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// The referenced work item or pipeline does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The requested state transition is not allowed from the current state.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The audit trail could not be written or read.
    #[error("Audit error: {0}")]
    Audit(String),

    /// A JSON serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PhasegateError {
    /// Whether the scheduler may retry the failed phase attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PhasegateError::Execution(_) | PhasegateError::LockTimeout(_)
        )
    }

    /// Stable process exit code for this failure category.
    pub fn exit_code(&self) -> u8 {
        match self {
            PhasegateError::Config(_) => 2,
            PhasegateError::NotFound(_) => 3,
            PhasegateError::InvalidTransition(_) => 4,
            _ => 1,
        }
    }
}
