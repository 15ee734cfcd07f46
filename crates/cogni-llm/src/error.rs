//! Transport error types.

use cogni_core::ExecutionError;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors from the LLM transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// HTTP request failed before a response arrived.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The proxy returned a non-success status.
    #[error("proxy error: {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body excerpt.
        message: String,
    },

    /// No response headers within the time-to-first-byte budget.
    #[error("timed out waiting for first byte")]
    FirstByteTimeout,

    /// The caller's cancellation signal fired before the first byte.
    #[error("aborted before first byte")]
    Aborted,

    /// The proxy reported an error mid-stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// A successful completion arrived without a provider call id.
    ///
    /// Billing joins on the call id; this must fail the run.
    #[error("successful completion missing provider call id")]
    MissingCallId,
}

impl TransportError {
    /// Classify this transport failure into the shared execution taxonomy.
    #[must_use]
    pub fn to_execution(&self) -> ExecutionError {
        match self {
            Self::Http(e) if e.is_timeout() => ExecutionError::Timeout,
            Self::Http(e) => ExecutionError::Internal(e.to_string()),
            Self::Api { status, message } => ExecutionError::from_status(*status, message.clone()),
            Self::FirstByteTimeout => ExecutionError::Timeout,
            Self::Aborted => ExecutionError::Aborted,
            Self::Stream(msg) => ExecutionError::Internal(msg.clone()),
            Self::MissingCallId => ExecutionError::MissingCallId,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cogni_core::ExecutionErrorCode;

    #[test]
    fn statuses_classify_through_shared_taxonomy() {
        let err = TransportError::Api {
            status: 429,
            message: "slow down".into(),
        };
        assert_eq!(err.to_execution().code(), ExecutionErrorCode::RateLimit);

        let err = TransportError::Api {
            status: 500,
            message: "boom".into(),
        };
        assert_eq!(err.to_execution().code(), ExecutionErrorCode::Internal);
    }

    #[test]
    fn missing_call_id_is_internal() {
        assert_eq!(
            TransportError::MissingCallId.to_execution().code(),
            ExecutionErrorCode::Internal
        );
    }

    #[test]
    fn abort_and_ttfb_classify() {
        assert_eq!(
            TransportError::Aborted.to_execution().code(),
            ExecutionErrorCode::Aborted
        );
        assert_eq!(
            TransportError::FirstByteTimeout.to_execution().code(),
            ExecutionErrorCode::Timeout
        );
    }
}
