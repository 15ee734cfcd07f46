//! RocksDB-backed credit ledger for the cogni pipeline.
//!
//! Balances, append-only ledger entries, charge receipts, and virtual keys
//! live here. Every mutation commits atomically in a single `WriteBatch`;
//! the materialized balance is arithmetic over the same batch, and the
//! ledger remains the source of truth.
//!
//! # Column families
//!
//! - `accounts` / `accounts_by_owner`: account records and the one-per-user
//!   upsert index
//! - `virtual_keys` / `default_key_by_account`: scope keys
//! - `entries` / `entries_by_account`: append-only balance changes
//! - `receipts` / `receipts_by_account`: idempotent settlement records
//!
//! # Example
//!
//! ```no_run
//! use cogni_ledger::{LedgerStore, RocksLedger};
//!
//! let store = RocksLedger::open("/tmp/cogni-ledger", None).unwrap();
//! let (account, key) = store.get_or_create_account(uuid::Uuid::new_v4()).unwrap();
//! let balance = store.get_balance(&account.id).unwrap();
//! assert_eq!(balance, 0);
//! # let _ = key;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;

pub use error::{LedgerError, Result};
pub use rocks::RocksLedger;

use chrono::{DateTime, Utc};

use cogni_core::{
    BillingAccount, BillingAccountId, ChargeParams, ChargeReceipt, EntryReason, LedgerEntry,
    VirtualKey, VirtualKeyId,
};

/// Maximum receipts returned by a single list call.
pub const MAX_RECEIPT_PAGE: usize = 1000;

/// The ledger storage trait.
///
/// Abstracts the store so the pipeline can run against RocksDB in
/// production and a temporary directory in tests.
pub trait LedgerStore: Send + Sync {
    // =========================================================================
    // Accounts & keys
    // =========================================================================

    /// Get the account for a user, creating the account and its default
    /// virtual key when absent. Upsert keyed on the owner index, so
    /// concurrent calls for one user converge on one account.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_or_create_account(
        &self,
        owner_user_id: uuid::Uuid,
    ) -> Result<(BillingAccount, VirtualKey)>;

    /// Get an account by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_account(&self, account_id: &BillingAccountId) -> Result<Option<BillingAccount>>;

    /// Get an account's current balance in credits.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::AccountNotFound` if the account doesn't exist.
    fn get_balance(&self, account_id: &BillingAccountId) -> Result<i64>;

    /// Get a virtual key by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_virtual_key(&self, key_id: &VirtualKeyId) -> Result<Option<VirtualKey>>;

    // =========================================================================
    // Mutations
    // =========================================================================

    /// The pre-call credit gate.
    ///
    /// Debits `cost_credits`, writes an `ai_usage` entry with
    /// `reference = request_id`, and returns the new balance. A zero cost
    /// writes nothing but still fails the gate when the balance is not
    /// positive, so an empty account never reaches the provider.
    ///
    /// # Errors
    ///
    /// - `LedgerError::InsufficientCredits` if the balance would go
    ///   negative; nothing is written.
    /// - `LedgerError::AccountNotFound` / `VirtualKeyNotFound` on
    ///   structural misuse.
    fn debit_for_usage(
        &self,
        account_id: &BillingAccountId,
        virtual_key_id: &VirtualKeyId,
        cost_credits: i64,
        request_id: &str,
        metadata: serde_json::Value,
    ) -> Result<i64>;

    /// The post-call settlement.
    ///
    /// Idempotent on `params.request_id`: when a receipt already exists the
    /// call returns silently. Otherwise the receipt, a `charge_receipt`
    /// ledger entry, and the balance decrement commit in one batch. The
    /// receipt probe doubles as the at-most-one `charge_receipt` entry
    /// guarantee per `(account, reference)`.
    ///
    /// This path never raises `InsufficientCredits`: a completed LLM call
    /// has already cost money, so a negative resulting balance is logged as
    /// a critical invariant breach and the write completes. When a
    /// settlement floor is configured the write is instead refused with
    /// `SettlementRefused` for out-of-band reconciliation.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or the configured
    /// floor refuses the write.
    fn record_charge_receipt(&self, params: ChargeParams) -> Result<()>;

    /// Credit an account and return the new balance.
    ///
    /// # Errors
    ///
    /// - `LedgerError::AccountNotFound` if the account doesn't exist.
    /// - `LedgerError::InvalidAmount` if `amount` is not positive.
    fn credit_account(
        &self,
        account_id: &BillingAccountId,
        amount: i64,
        reason: EntryReason,
        reference: Option<String>,
    ) -> Result<i64>;

    // =========================================================================
    // Reads
    // =========================================================================

    /// List ledger entries for an account, newest first, optionally
    /// filtered by reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_entries(
        &self,
        account_id: &BillingAccountId,
        limit: usize,
        offset: usize,
        reason: Option<EntryReason>,
    ) -> Result<Vec<LedgerEntry>>;

    /// Find a receipt by its request id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_receipt(&self, request_id: &str) -> Result<Option<ChargeReceipt>>;

    /// List receipts for an account within a time range, oldest first.
    /// `limit` is clamped to [`MAX_RECEIPT_PAGE`].
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_receipts(
        &self,
        account_id: &BillingAccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ChargeReceipt>>;
}
