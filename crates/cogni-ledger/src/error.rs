//! Error types for the credit ledger.

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur in ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Billing account not found. Structural: routes validate first.
    #[error("account not found: {account_id}")]
    AccountNotFound {
        /// The account id that was not found.
        account_id: String,
    },

    /// Virtual key not found. Structural: routes validate first.
    #[error("virtual key not found: {virtual_key_id}")]
    VirtualKeyNotFound {
        /// The key id that was not found.
        virtual_key_id: String,
    },

    /// The pre-call gate refused the debit.
    #[error("insufficient credits: balance={balance}, attempted={attempted}")]
    InsufficientCredits {
        /// Balance before the attempted debit.
        balance: i64,
        /// Credits the debit attempted to take.
        attempted: i64,
    },

    /// Settlement would dip below the configured floor.
    ///
    /// Only raised when a floor is explicitly configured; the default
    /// behavior lets settlement drive the balance negative.
    #[error("settlement refused: balance would reach {would_reach}, floor={floor}")]
    SettlementRefused {
        /// Balance the settlement would produce.
        would_reach: i64,
        /// The configured floor.
        floor: i64,
    },

    /// Invalid amount for the operation.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
}
