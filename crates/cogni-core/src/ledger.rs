//! Ledger entries and charge receipts.
//!
//! Entries are append-only records of balance changes. A charge receipt
//! pairs a settlement debit with the provider call id that acts as its
//! idempotency key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BillingAccountId, EntryId, VirtualKeyId};

/// Why a ledger entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryReason {
    /// Pre-call debit taken by the credit gate.
    AiUsage,

    /// Post-call settlement debit paired with a charge receipt.
    ChargeReceipt,

    /// Credits granted to the account.
    Credit,

    /// Manual correction.
    Adjustment,
}

impl EntryReason {
    /// Get the reason as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AiUsage => "ai_usage",
            Self::ChargeReceipt => "charge_receipt",
            Self::Credit => "credit",
            Self::Adjustment => "adjustment",
        }
    }
}

/// An append-only record of one balance change.
///
/// Invariant: `balance_after` equals the previous entry's `balance_after`
/// plus `amount`, in commit order per account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique, time-ordered entry id.
    pub id: EntryId,

    /// The account whose balance changed.
    pub billing_account_id: BillingAccountId,

    /// The scope key the change executed under.
    pub virtual_key_id: VirtualKeyId,

    /// Signed credit delta. Negative = debit.
    pub amount: i64,

    /// Balance after this entry was applied.
    pub balance_after: i64,

    /// Why the entry was written.
    pub reason: EntryReason,

    /// Opaque idempotency reference (request id or receipt request id).
    pub reference: String,

    /// Additional context. Never contains prompt or completion content.
    pub metadata: serde_json::Value,

    /// When the entry was committed.
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Create a pre-call usage debit entry.
    #[must_use]
    pub fn ai_usage(
        billing_account_id: BillingAccountId,
        virtual_key_id: VirtualKeyId,
        cost_credits: i64,
        balance_after: i64,
        reference: String,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: EntryId::generate(),
            billing_account_id,
            virtual_key_id,
            amount: -cost_credits.abs(),
            balance_after,
            reason: EntryReason::AiUsage,
            reference,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Create a settlement debit entry paired with a charge receipt.
    #[must_use]
    pub fn charge_receipt(
        billing_account_id: BillingAccountId,
        virtual_key_id: VirtualKeyId,
        charged_credits: i64,
        balance_after: i64,
        request_id: String,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: EntryId::generate(),
            billing_account_id,
            virtual_key_id,
            amount: -charged_credits.abs(),
            balance_after,
            reason: EntryReason::ChargeReceipt,
            reference: request_id,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Create a credit grant entry.
    #[must_use]
    pub fn credit(
        billing_account_id: BillingAccountId,
        virtual_key_id: VirtualKeyId,
        amount: i64,
        balance_after: i64,
        reference: String,
    ) -> Self {
        Self {
            id: EntryId::generate(),
            billing_account_id,
            virtual_key_id,
            amount: amount.abs(),
            balance_after,
            reason: EntryReason::Credit,
            reference,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }
}

/// The immutable settlement record for one provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeReceipt {
    /// Primary idempotency key. In practice the provider call id.
    pub request_id: String,

    /// The account charged.
    pub billing_account_id: BillingAccountId,

    /// The scope key the call executed under.
    pub virtual_key_id: VirtualKeyId,

    /// Credits debited. Never negative.
    pub charged_credits: i64,

    /// Provider call id, when distinct from `request_id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_call_id: Option<String>,

    /// Provider-reported cost in USD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_cost_usd: Option<f64>,

    /// Why the charge was made (e.g. `ai_usage`).
    pub charge_reason: String,

    /// System that produced the fact (e.g. `litellm`).
    pub source_system: String,

    /// Reference into the source system (e.g. run id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<String>,

    /// When the receipt was written.
    pub created_at: DateTime<Utc>,
}

/// Input for recording a charge receipt.
#[derive(Debug, Clone)]
pub struct ChargeParams {
    /// Idempotency key; usually the provider call id.
    pub request_id: String,

    /// The account to charge.
    pub billing_account_id: BillingAccountId,

    /// The scope key.
    pub virtual_key_id: VirtualKeyId,

    /// Credits to debit.
    pub charged_credits: i64,

    /// Provider call id.
    pub provider_call_id: Option<String>,

    /// Provider-reported cost in USD.
    pub provider_cost_usd: Option<f64>,

    /// Why the charge was made.
    pub charge_reason: String,

    /// System that produced the fact.
    pub source_system: String,

    /// Reference into the source system.
    pub source_reference: Option<String>,

    /// Extra context for the paired ledger entry.
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_entry_is_negative() {
        let account = BillingAccountId::generate();
        let key = VirtualKeyId::generate();
        let entry = LedgerEntry::ai_usage(
            account,
            key,
            5,
            995,
            "req-1".into(),
            serde_json::Value::Null,
        );
        assert_eq!(entry.amount, -5);
        assert_eq!(entry.reason, EntryReason::AiUsage);
        assert_eq!(entry.balance_after, 995);
    }

    #[test]
    fn charge_receipt_entry_references_request_id() {
        let account = BillingAccountId::generate();
        let key = VirtualKeyId::generate();
        let entry = LedgerEntry::charge_receipt(
            account,
            key,
            2,
            998,
            "gen-abc".into(),
            serde_json::Value::Null,
        );
        assert_eq!(entry.reference, "gen-abc");
        assert_eq!(entry.amount, -2);
    }

    #[test]
    fn credit_entry_is_positive() {
        let account = BillingAccountId::generate();
        let key = VirtualKeyId::generate();
        let entry = LedgerEntry::credit(account, key, 1000, 1000, "topup-1".into());
        assert_eq!(entry.amount, 1000);
        assert_eq!(entry.reason, EntryReason::Credit);
    }

    #[test]
    fn reason_strings() {
        assert_eq!(EntryReason::AiUsage.as_str(), "ai_usage");
        assert_eq!(EntryReason::ChargeReceipt.as_str(), "charge_receipt");
    }
}
