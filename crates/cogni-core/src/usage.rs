//! Usage facts and the credit conversion policy.
//!
//! A usage fact is the normalized record of one LLM round-trip. Exactly one
//! fact is emitted per successful completion unit, keyed by the provider
//! call id so the settlement path can de-duplicate across sources.

use serde::{Deserialize, Serialize};

use crate::{BillingAccountId, RunId, VirtualKeyId};

/// Source tag for facts produced through the internal proxy.
pub const USAGE_SOURCE_LITELLM: &str = "litellm";

/// Which executor produced a usage fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// In-process graph runner.
    Inproc,
    /// Sandboxed container runner.
    Sandbox,
}

impl ExecutorKind {
    /// Get the executor kind as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inproc => "inproc",
            Self::Sandbox => "sandbox",
        }
    }
}

/// One normalized usage record per LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageFact {
    /// The run this call belongs to.
    pub run_id: RunId,

    /// Retry ordinal. Frozen at 0 until a retry system exists.
    pub attempt: i32,

    /// Upstream source system (currently always `litellm`).
    pub source: String,

    /// Which executor produced the call.
    pub executor: ExecutorKind,

    /// The account being charged.
    pub billing_account_id: BillingAccountId,

    /// The scope key the run executed under.
    pub virtual_key_id: VirtualKeyId,

    /// Namespaced graph id of the run.
    pub graph_id: String,

    /// Prompt tokens, when the provider reported them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,

    /// Completion tokens, when the provider reported them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,

    /// Provider call id. Required; this is the idempotency join key for
    /// settlement and the audit path.
    pub usage_unit_id: String,

    /// Model that served the call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Provider-reported cost in USD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// Conversion policy from provider USD cost to integer credits.
///
/// Credits are integers to keep ledger arithmetic exact; the minimum-charge
/// rule guarantees any non-zero provider cost debits at least one credit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreditPolicy {
    /// How many credits one USD buys.
    pub credits_per_usd: i64,
}

impl Default for CreditPolicy {
    fn default() -> Self {
        Self {
            credits_per_usd: 1000,
        }
    }
}

impl CreditPolicy {
    /// Convert a USD cost to credits.
    ///
    /// Zero or negative costs charge nothing; any positive cost charges at
    /// least one credit.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn credits_for_usd(&self, cost_usd: f64) -> i64 {
        if cost_usd <= 0.0 {
            return 0;
        }
        let raw = (cost_usd * self.credits_per_usd as f64).round() as i64;
        raw.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_credit_cost_charges_one_credit() {
        let policy = CreditPolicy {
            credits_per_usd: 1000,
        };
        assert_eq!(policy.credits_for_usd(0.0005), 1);
        assert_eq!(policy.credits_for_usd(0.000_001), 1);
    }

    #[test]
    fn zero_cost_charges_nothing() {
        let policy = CreditPolicy::default();
        assert_eq!(policy.credits_for_usd(0.0), 0);
        assert_eq!(policy.credits_for_usd(-1.0), 0);
    }

    #[test]
    fn rounding_is_to_nearest() {
        let policy = CreditPolicy {
            credits_per_usd: 1000,
        };
        assert_eq!(policy.credits_for_usd(0.002), 2);
        assert_eq!(policy.credits_for_usd(0.0024), 2);
        assert_eq!(policy.credits_for_usd(0.0026), 3);
    }

    #[test]
    fn executor_kind_strings() {
        assert_eq!(ExecutorKind::Inproc.as_str(), "inproc");
        assert_eq!(ExecutorKind::Sandbox.as_str(), "sandbox");
    }
}
