//! The usage/charge recorder.
//!
//! Consumes `usage_report` events and settles them against the ledger as
//! idempotent charge receipts keyed on the provider call id. The recorder
//! sits on the request path, so it logs failures instead of raising them.

use std::sync::Arc;

use cogni_core::{AiEvent, ChargeParams, CreditPolicy, UsageFact};
use cogni_ledger::{LedgerError, LedgerStore};

/// Settles usage facts into charge receipts and ledger debits.
#[derive(Clone)]
pub struct UsageRecorder {
    ledger: Arc<dyn LedgerStore>,
    policy: CreditPolicy,
}

impl UsageRecorder {
    /// Create a recorder over the given ledger.
    #[must_use]
    pub fn new(ledger: Arc<dyn LedgerStore>, policy: CreditPolicy) -> Self {
        Self { ledger, policy }
    }

    /// Inspect one stream event, settling it if it is a usage report.
    pub fn observe_event(&self, event: &AiEvent) {
        if let AiEvent::UsageReport { fact } = event {
            self.record(fact);
        }
    }

    /// Settle one usage fact. Never fails the caller.
    pub fn record(&self, fact: &UsageFact) {
        // Defense in depth: the completion unit already hard-fails runs
        // without a call id, but a fact that slips through must not mint a
        // receipt with an empty idempotency key.
        if fact.usage_unit_id.is_empty() {
            tracing::warn!(run_id = %fact.run_id, "Dropping usage fact without usage_unit_id");
            return;
        }

        let charged_credits = fact
            .cost_usd
            .map_or(0, |cost| self.policy.credits_for_usd(cost));

        let params = ChargeParams {
            request_id: fact.usage_unit_id.clone(),
            billing_account_id: fact.billing_account_id,
            virtual_key_id: fact.virtual_key_id,
            charged_credits,
            provider_call_id: Some(fact.usage_unit_id.clone()),
            provider_cost_usd: fact.cost_usd,
            charge_reason: "ai_usage".into(),
            source_system: fact.source.clone(),
            source_reference: Some(fact.run_id.to_string()),
            metadata: serde_json::json!({
                "graph_id": &fact.graph_id,
                "executor": fact.executor.as_str(),
                "attempt": fact.attempt,
                "model": &fact.model,
                "input_tokens": fact.input_tokens,
                "output_tokens": fact.output_tokens,
            }),
        };

        match self.ledger.record_charge_receipt(params) {
            Ok(()) => {
                tracing::debug!(
                    usage_unit_id = %fact.usage_unit_id,
                    charged_credits,
                    "Charge receipt settled"
                );
            }
            Err(LedgerError::SettlementRefused { would_reach, floor }) => {
                tracing::error!(
                    usage_unit_id = %fact.usage_unit_id,
                    would_reach,
                    floor,
                    "Settlement refused by configured floor; charge queued for reconciliation"
                );
            }
            Err(e) => {
                // Transient failures must not fail a completed LLM call.
                tracing::error!(
                    usage_unit_id = %fact.usage_unit_id,
                    error = %e,
                    "Charge receipt write failed"
                );
            }
        }
    }
}
