//! Execution error taxonomy and the shared classifier.
//!
//! Every failure in the pipeline normalizes to one of the stable codes in
//! [`ExecutionErrorCode`] before it reaches a stream, a final, or a trace.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for execution-path operations.
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Stable error codes surfaced to callers and traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorCode {
    /// The caller cancelled the run.
    Aborted,
    /// The upstream provider timed out.
    Timeout,
    /// The upstream provider rate-limited the call.
    RateLimit,
    /// The pre-call credit gate refused the run.
    InsufficientCredits,
    /// No provider owns the requested graph.
    NotFound,
    /// The request was malformed (e.g. a graph id without a namespace).
    InvalidRequest,
    /// Everything else, including provider 4xx/5xx and billing-safety
    /// breaches.
    Internal,
}

impl ExecutionErrorCode {
    /// Return the stable wire string for this code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::InsufficientCredits => "insufficient_credits",
            Self::NotFound => "not_found",
            Self::InvalidRequest => "invalid_request",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ExecutionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified execution failure.
///
/// Constructors capture the raw cause; [`ExecutionError::code`] is the single
/// normalizer mapping every cause to a stable code.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    /// The run's cancellation signal fired.
    #[error("run aborted")]
    Aborted,

    /// The upstream provider returned HTTP 408 or the transport timed out.
    #[error("upstream timeout")]
    Timeout,

    /// The upstream provider returned HTTP 429.
    #[error("upstream rate limit")]
    RateLimited,

    /// The pre-call credit gate refused the debit.
    #[error("insufficient credits: balance={balance}, attempted={attempted}")]
    InsufficientCredits {
        /// Balance before the attempted debit.
        balance: i64,
        /// Credits the debit attempted to take.
        attempted: i64,
    },

    /// No registered provider claims the graph id.
    #[error("unknown graph: {graph_id}")]
    GraphNotFound {
        /// The graph id that failed to route.
        graph_id: String,
    },

    /// The graph id is not of the form `<provider>:<graph>`.
    #[error("malformed graph id: {graph_id}")]
    InvalidGraphId {
        /// The offending graph id.
        graph_id: String,
    },

    /// A successful completion came back without a provider call id.
    ///
    /// Downstream billing joins on the call id, so this must fail the run
    /// rather than under-bill silently.
    #[error("provider returned no call id for a successful completion")]
    MissingCallId,

    /// The upstream provider returned a non-success HTTP status.
    #[error("provider error: status={status}: {message}")]
    Provider {
        /// The HTTP status code.
        status: u16,
        /// Provider-supplied detail.
        message: String,
    },

    /// Any other failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecutionError {
    /// Normalize this failure to its stable code.
    ///
    /// This is the single classifier for the whole pipeline; provider 4xx
    /// and 5xx statuses are logged with their class before collapsing to
    /// `internal`.
    #[must_use]
    pub fn code(&self) -> ExecutionErrorCode {
        match self {
            Self::Aborted => ExecutionErrorCode::Aborted,
            Self::Timeout => ExecutionErrorCode::Timeout,
            Self::RateLimited => ExecutionErrorCode::RateLimit,
            Self::InsufficientCredits { .. } => ExecutionErrorCode::InsufficientCredits,
            Self::GraphNotFound { .. } => ExecutionErrorCode::NotFound,
            Self::InvalidGraphId { .. } => ExecutionErrorCode::InvalidRequest,
            Self::MissingCallId => ExecutionErrorCode::Internal,
            Self::Provider { status, message } => {
                if *status == 408 {
                    ExecutionErrorCode::Timeout
                } else if *status == 429 {
                    ExecutionErrorCode::RateLimit
                } else if (400..500).contains(status) {
                    tracing::warn!(status = *status, message = %message, class = "provider_4xx", "Provider client error");
                    ExecutionErrorCode::Internal
                } else {
                    tracing::warn!(status = *status, message = %message, class = "provider_5xx", "Provider server error");
                    ExecutionErrorCode::Internal
                }
            }
            Self::Internal(_) => ExecutionErrorCode::Internal,
        }
    }

    /// Classify an upstream HTTP status into an execution error.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            408 => Self::Timeout,
            429 => Self::RateLimited,
            _ => Self::Provider {
                status,
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_strings() {
        assert_eq!(ExecutionErrorCode::Aborted.as_str(), "aborted");
        assert_eq!(
            ExecutionErrorCode::InsufficientCredits.as_str(),
            "insufficient_credits"
        );
        assert_eq!(
            serde_json::to_string(&ExecutionErrorCode::RateLimit).unwrap(),
            "\"rate_limit\""
        );
    }

    #[test]
    fn classifier_maps_statuses() {
        assert_eq!(
            ExecutionError::from_status(408, "slow").code(),
            ExecutionErrorCode::Timeout
        );
        assert_eq!(
            ExecutionError::from_status(429, "busy").code(),
            ExecutionErrorCode::RateLimit
        );
        assert_eq!(
            ExecutionError::from_status(422, "bad").code(),
            ExecutionErrorCode::Internal
        );
        assert_eq!(
            ExecutionError::from_status(503, "down").code(),
            ExecutionErrorCode::Internal
        );
    }

    #[test]
    fn billing_safety_is_internal() {
        assert_eq!(ExecutionError::MissingCallId.code(), ExecutionErrorCode::Internal);
    }

    #[test]
    fn structural_codes() {
        assert_eq!(
            ExecutionError::GraphNotFound {
                graph_id: "claude:poet".into()
            }
            .code(),
            ExecutionErrorCode::NotFound
        );
        assert_eq!(
            ExecutionError::InvalidGraphId {
                graph_id: "poet".into()
            }
            .code(),
            ExecutionErrorCode::InvalidRequest
        );
    }
}
