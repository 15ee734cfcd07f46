//! Sandbox error types.

use cogni_core::ExecutionError;

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors from the sandbox subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The container engine refused or failed an operation.
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// The proxy socket never became ready.
    #[error("proxy not ready after {attempts} attempts")]
    ProxyNotReady {
        /// Readiness probes attempted.
        attempts: usize,
    },

    /// No proxy is registered for the run.
    #[error("no proxy registered for run {run_id}")]
    ProxyMissing {
        /// The run id.
        run_id: String,
    },

    /// The agent hit its wall-clock limit and was killed.
    #[error("sandbox hit its runtime limit")]
    RuntimeLimit,

    /// The agent was OOM-killed.
    #[error("sandbox was OOM-killed")]
    OomKilled,

    /// The agent exited non-zero.
    #[error("sandbox exited with code {exit_code}")]
    NonZeroExit {
        /// The container's exit code.
        exit_code: i64,
    },

    /// The agent made LLM calls but the audit log yielded no billable
    /// entries: billing would be silently incomplete.
    #[error("audit log has {lines} lines but no billable entries")]
    AuditEmpty {
        /// Raw audit lines seen.
        lines: usize,
    },

    /// The caller cancelled the run.
    #[error("sandbox run aborted")]
    Aborted,

    /// Workspace or log I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Classify this failure into the shared execution taxonomy.
    #[must_use]
    pub fn to_execution(&self) -> ExecutionError {
        match self {
            Self::RuntimeLimit => ExecutionError::Timeout,
            Self::Aborted => ExecutionError::Aborted,
            other => ExecutionError::Internal(other.to_string()),
        }
    }
}
