//! Billing account and virtual key records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BillingAccountId, VirtualKeyId};

/// The per-user credit container.
///
/// `balance_credits` is a materialized count maintained arithmetically
/// inside each debit/credit batch; the ledger remains the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingAccount {
    /// Unique account id.
    pub id: BillingAccountId,

    /// The owning user. One account per user.
    pub owner_user_id: uuid::Uuid,

    /// Current balance in credits. May go negative under post-call
    /// settlement.
    pub balance_credits: i64,

    /// When the account was created.
    pub created_at: DateTime<Utc>,

    /// When the balance last changed.
    pub updated_at: DateTime<Utc>,
}

impl BillingAccount {
    /// Create a fresh account with zero balance.
    #[must_use]
    pub fn new(owner_user_id: uuid::Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: BillingAccountId::generate(),
            owner_user_id,
            balance_credits: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A scope handle attached to a billing account.
///
/// Virtual keys carry no secret material; they exist so usage can be
/// attributed to a scope narrower than the account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualKey {
    /// Unique key id.
    pub id: VirtualKeyId,

    /// The owning account.
    pub billing_account_id: BillingAccountId,

    /// Human-readable label.
    pub label: String,

    /// Whether this is the account's default key. Exactly one per account.
    pub is_default: bool,

    /// Whether the key is usable.
    pub active: bool,

    /// When the key was created.
    pub created_at: DateTime<Utc>,
}

impl VirtualKey {
    /// Create the default key for an account.
    #[must_use]
    pub fn default_for(account_id: BillingAccountId) -> Self {
        Self {
            id: VirtualKeyId::generate(),
            billing_account_id: account_id,
            label: "default".into(),
            is_default: true,
            active: true,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_account_starts_at_zero() {
        let account = BillingAccount::new(uuid::Uuid::new_v4());
        assert_eq!(account.balance_credits, 0);
    }

    #[test]
    fn default_key_is_default_and_active() {
        let account = BillingAccount::new(uuid::Uuid::new_v4());
        let key = VirtualKey::default_for(account.id);
        assert!(key.is_default);
        assert!(key.active);
        assert_eq!(key.billing_account_id, account.id);
    }
}
