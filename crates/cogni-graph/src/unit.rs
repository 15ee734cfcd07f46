//! The completion unit: one LLM round-trip, one usage fact.
//!
//! Every graph step reaches the LLM through [`CompletionUnit::execute`].
//! The unit debits the credit gate before the call, forwards deltas while
//! the stream runs, and emits exactly one `usage_report` once the final is
//! known. The final is awaited only after the stream's `done` breaks the
//! consumption loop; awaiting it inside the loop would deadlock, because
//! the transport settles it in its stream-completion hook.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cogni_core::{
    AiEvent, ChatMessage, CreditPolicy, ExecutionError, ExecutorKind, FinishReason, RunCaller,
    RunId, UsageFact, UsageTotals, USAGE_SOURCE_LITELLM,
};
use cogni_ledger::{LedgerError, LedgerStore};
use cogni_llm::{deferred, CompletionRequest, LlmClient, Promise};

use crate::stream::RUN_EVENT_BUFFER;

/// Input for one completion unit execution.
#[derive(Debug, Clone)]
pub struct UnitParams {
    /// The run this step belongs to.
    pub run_id: RunId,

    /// Ingress request id for delivery correlation.
    pub ingress_request_id: String,

    /// Namespaced graph id of the run.
    pub graph_id: String,

    /// Which executor is driving the step.
    pub executor: ExecutorKind,

    /// Caller identity and correlation.
    pub caller: RunCaller,

    /// Messages for this step.
    pub messages: Vec<ChatMessage>,

    /// Model to invoke.
    pub model: String,

    /// Sampling temperature.
    pub temperature: Option<f32>,

    /// Output token cap.
    pub max_tokens: Option<u32>,

    /// Credits reserved by the pre-call gate. Zero still probes solvency.
    pub precharge_credits: i64,

    /// Cancellation signal.
    pub cancel: CancellationToken,
}

/// What one completed unit produced.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    /// Assistant content (partial when `aborted`).
    pub content: String,

    /// Why generation stopped.
    pub finish_reason: FinishReason,

    /// Token usage when reported.
    pub usage: Option<UsageTotals>,

    /// Whether the caller aborted mid-stream.
    pub aborted: bool,
}

/// The shared engine for LLM-backed graph steps.
#[derive(Clone)]
pub struct CompletionUnit {
    llm: Arc<LlmClient>,
    ledger: Arc<dyn LedgerStore>,
    policy: CreditPolicy,
}

impl CompletionUnit {
    /// Create a completion unit over the given transport and ledger.
    #[must_use]
    pub fn new(llm: Arc<LlmClient>, ledger: Arc<dyn LedgerStore>, policy: CreditPolicy) -> Self {
        Self {
            llm,
            ledger,
            policy,
        }
    }

    /// The credit policy this unit settles under.
    #[must_use]
    pub const fn policy(&self) -> CreditPolicy {
        self.policy
    }

    /// Execute one completion unit.
    ///
    /// Returns the step's event stream (`text_delta`s, then at most one
    /// `usage_report`) and a promise of the outcome. Pre-call failures
    /// settle the promise with an error and leave the stream empty; they
    /// never panic into the caller's event loop.
    pub async fn execute(
        &self,
        params: UnitParams,
    ) -> (
        mpsc::Receiver<AiEvent>,
        Promise<Result<UnitOutcome, ExecutionError>>,
    ) {
        // Pre-call gate. A refusal is a normal outcome, not an exception.
        let gate = self.ledger.debit_for_usage(
            &params.caller.billing_account_id,
            &params.caller.virtual_key_id,
            params.precharge_credits,
            &params.ingress_request_id,
            serde_json::json!({
                "run_id": params.run_id,
                "graph_id": &params.graph_id,
            }),
        );

        if let Err(e) = gate {
            let error = match e {
                LedgerError::InsufficientCredits { balance, attempted } => {
                    ExecutionError::InsufficientCredits { balance, attempted }
                }
                other => ExecutionError::Internal(other.to_string()),
            };
            return Self::settled_failure(error);
        }

        let request = CompletionRequest {
            messages: params.messages.clone(),
            model: params.model.clone(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            end_user: Some(params.caller.billing_account_id.to_string()),
            metadata: serde_json::json!({
                "run_id": params.run_id,
                "request_id": &params.ingress_request_id,
                "trace_id": params.caller.trace_id.as_ref().map(cogni_core::TraceId::as_str),
                "session_id": &params.caller.session_id,
            }),
        };

        let (inner_rx, inner_final) = match self
            .llm
            .completion_stream(&request, params.cancel.clone())
            .await
        {
            Ok(pair) => pair,
            Err(e) => return Self::settled_failure(e.to_execution()),
        };

        let (tx, rx) = mpsc::channel(RUN_EVENT_BUFFER);
        let (outcome_tx, outcome_rx) = deferred();

        let fact_template = FactTemplate {
            run_id: params.run_id,
            executor: params.executor,
            caller: params.caller.clone(),
            graph_id: params.graph_id.clone(),
        };

        tokio::spawn(drive_unit(inner_rx, inner_final, tx, outcome_tx, fact_template));

        (rx, outcome_rx)
    }

    fn settled_failure(
        error: ExecutionError,
    ) -> (
        mpsc::Receiver<AiEvent>,
        Promise<Result<UnitOutcome, ExecutionError>>,
    ) {
        let (_tx, rx) = mpsc::channel(1);
        let (outcome_tx, outcome_rx) = deferred();
        outcome_tx.settle(Err(error));
        (rx, outcome_rx)
    }
}

/// Everything needed to mint the step's usage fact.
struct FactTemplate {
    run_id: RunId,
    executor: ExecutorKind,
    caller: RunCaller,
    graph_id: String,
}

/// Forward the transport stream, then settle the unit outcome.
async fn drive_unit(
    mut inner_rx: mpsc::Receiver<AiEvent>,
    inner_final: Promise<cogni_llm::Result<cogni_llm::CompletionOutcome>>,
    tx: mpsc::Sender<AiEvent>,
    outcome_tx: Arc<cogni_llm::Deferred<Result<UnitOutcome, ExecutionError>>>,
    fact: FactTemplate,
) {
    let mut consumer_gone = false;

    // Consume the transport stream to its end. `done` is swallowed: the
    // runner owns run-level termination.
    while let Some(event) = inner_rx.recv().await {
        match event {
            AiEvent::Done => break,
            AiEvent::TextDelta { .. } | AiEvent::Error { .. } => {
                if !consumer_gone && tx.send(event).await.is_err() {
                    consumer_gone = true;
                    tracing::warn!(run_id = %fact.run_id, "Step consumer dropped mid-stream");
                }
            }
            // The transport emits nothing else; ignore defensively-typed
            // variants rather than crash the run.
            _ => {}
        }
    }

    // The stream loop is over; only now is the final safe to await.
    let resolved = inner_final.wait().await;

    let completed = match resolved {
        None => {
            outcome_tx.settle(Err(ExecutionError::Internal(
                "transport final never settled".into(),
            )));
            return;
        }
        Some(Err(e)) => {
            outcome_tx.settle(Err(e.to_execution()));
            return;
        }
        Some(Ok(outcome)) => outcome,
    };

    // Billing safety: a non-aborted success without a call id must fail
    // the run rather than skip settlement.
    let call_id = match (&completed.call_id, completed.aborted) {
        (Some(id), _) => Some(id.clone()),
        (None, true) => None,
        (None, false) => {
            outcome_tx.settle(Err(ExecutionError::MissingCallId));
            return;
        }
    };

    let usage = match (completed.input_tokens, completed.output_tokens) {
        (None, None) => None,
        (input, output) => Some(UsageTotals {
            input_tokens: input.unwrap_or(0),
            output_tokens: output.unwrap_or(0),
        }),
    };

    // Exactly one usage fact per completed call. An aborted stream emits
    // one only when the upstream got far enough to report usage or cost.
    let report_worthy = !completed.aborted
        || completed.cost_usd.is_some()
        || usage.is_some();

    if let Some(unit_id) = call_id.filter(|_| report_worthy) {
        let report = AiEvent::UsageReport {
            fact: UsageFact {
                run_id: fact.run_id,
                attempt: 0,
                source: USAGE_SOURCE_LITELLM.to_string(),
                executor: fact.executor,
                billing_account_id: fact.caller.billing_account_id,
                virtual_key_id: fact.caller.virtual_key_id,
                graph_id: fact.graph_id,
                input_tokens: completed.input_tokens,
                output_tokens: completed.output_tokens,
                usage_unit_id: unit_id,
                model: completed.model.clone(),
                cost_usd: completed.cost_usd,
            },
        };
        if !consumer_gone && tx.send(report).await.is_err() {
            tracing::warn!(run_id = %fact.run_id, "Usage report had no audience");
        }
    }

    outcome_tx.settle(Ok(UnitOutcome {
        content: completed.content,
        finish_reason: completed.finish_reason,
        usage,
        aborted: completed.aborted,
    }));
}
