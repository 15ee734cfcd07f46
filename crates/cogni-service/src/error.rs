//! API error types and the HTTP projection of execution error codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use cogni_core::ExecutionErrorCode;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Insufficient credits.
    #[error("insufficient credits: balance={balance}, attempted={attempted}")]
    InsufficientCredits {
        /// Current balance.
        balance: i64,
        /// Attempted debit.
        attempted: i64,
    },

    /// The upstream provider rate-limited the run.
    #[error("rate limited")]
    RateLimited,

    /// The upstream provider timed out.
    #[error("upstream timeout")]
    Timeout,

    /// The client went away.
    #[error("client closed request")]
    Aborted,

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Project a run-level error code onto the HTTP surface.
    #[must_use]
    pub fn from_code(code: ExecutionErrorCode) -> Self {
        match code {
            ExecutionErrorCode::Aborted => Self::Aborted,
            ExecutionErrorCode::Timeout => Self::Timeout,
            ExecutionErrorCode::RateLimit => Self::RateLimited,
            ExecutionErrorCode::InsufficientCredits => Self::InsufficientCredits {
                balance: 0,
                attempted: 0,
            },
            ExecutionErrorCode::NotFound => Self::NotFound("graph not found".into()),
            ExecutionErrorCode::InvalidRequest => Self::BadRequest("malformed graph id".into()),
            ExecutionErrorCode::Internal => Self::Internal("run failed".into()),
        }
    }
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
            ),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::InsufficientCredits { balance, attempted } => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_credits",
                self.to_string(),
                Some(serde_json::json!({
                    "balance": balance,
                    "attempted": attempted
                })),
            ),
            Self::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit",
                self.to_string(),
                None,
            ),
            Self::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                self.to_string(),
                None,
            ),
            Self::Aborted => (
                // 499 Client Closed Request (nginx convention).
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
                "aborted",
                self.to_string(),
                None,
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<cogni_ledger::LedgerError> for ApiError {
    fn from(err: cogni_ledger::LedgerError) -> Self {
        match err {
            cogni_ledger::LedgerError::AccountNotFound { account_id } => {
                Self::NotFound(format!("account not found: {account_id}"))
            }
            cogni_ledger::LedgerError::VirtualKeyNotFound { virtual_key_id } => {
                Self::NotFound(format!("virtual key not found: {virtual_key_id}"))
            }
            cogni_ledger::LedgerError::InsufficientCredits { balance, attempted } => {
                Self::InsufficientCredits { balance, attempted }
            }
            cogni_ledger::LedgerError::InvalidAmount(msg) => Self::BadRequest(msg),
            cogni_ledger::LedgerError::Database(msg)
            | cogni_ledger::LedgerError::Serialization(msg) => Self::Internal(msg),
            cogni_ledger::LedgerError::SettlementRefused { .. } => {
                Self::Internal("settlement refused".into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_projection_matches_the_contract() {
        assert!(matches!(
            ApiError::from_code(ExecutionErrorCode::Timeout),
            ApiError::Timeout
        ));
        assert!(matches!(
            ApiError::from_code(ExecutionErrorCode::RateLimit),
            ApiError::RateLimited
        ));
        assert!(matches!(
            ApiError::from_code(ExecutionErrorCode::InsufficientCredits),
            ApiError::InsufficientCredits { .. }
        ));
        assert!(matches!(
            ApiError::from_code(ExecutionErrorCode::NotFound),
            ApiError::NotFound(_)
        ));
    }
}
