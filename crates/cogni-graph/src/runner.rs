//! The in-process graph runner.
//!
//! Graphs are factories resolved from a per-provider catalog. A graph's
//! logic receives a [`GraphContext`] giving it exactly two capabilities:
//! running completion units and invoking tools under the run's policy. The
//! runner owns run-level termination: one `assistant_final`, then one
//! `done`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use cogni_core::{
    AiEvent, ChatMessage, ExecutionError, ExecutorKind, FinishReason, GraphFinal, GraphRef,
    RunRequest, UsageTotals,
};
use cogni_llm::deferred;

use crate::provider::{GraphCatalogEntry, GraphExecutor, GraphProvider};
use crate::stream::{error_run, RunHandle, RUN_EVENT_BUFFER};
use crate::tools::{ToolExecutor, ToolOutcome, ToolPolicy, ToolRegistry};
use crate::unit::{CompletionUnit, UnitOutcome, UnitParams};

/// Mutable run state shared between the context and the runner task.
#[derive(Debug, Default)]
struct RunState {
    usage: UsageTotals,
    has_usage: bool,
    finish_reason: Option<FinishReason>,
    aborted: bool,
    error_emitted: bool,
}

/// Capabilities handed to a graph's logic.
pub struct GraphContext {
    request: RunRequest,
    model: String,
    precharge_credits: i64,
    unit: CompletionUnit,
    tools: ToolExecutor,
    events: mpsc::Sender<AiEvent>,
    state: Mutex<RunState>,
}

impl GraphContext {
    /// The conversation the run started with.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.request.messages
    }

    /// The run request being executed.
    #[must_use]
    pub fn request(&self) -> &RunRequest {
        &self.request
    }

    /// Run one completion unit over the given messages, forwarding its
    /// deltas and usage report onto the run stream.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the step.
    pub async fn complete(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<UnitOutcome, ExecutionError> {
        let params = UnitParams {
            run_id: self.request.run_id,
            ingress_request_id: self.request.ingress_request_id.clone(),
            graph_id: self.request.graph_id.clone(),
            executor: ExecutorKind::Inproc,
            caller: self.request.caller.clone(),
            messages,
            model: self.model.clone(),
            temperature: None,
            max_tokens: None,
            precharge_credits: self.precharge_credits,
            cancel: self.request.cancel.clone(),
        };

        let (mut rx, outcome_rx) = self.unit.execute(params).await;

        while let Some(event) = rx.recv().await {
            if matches!(event, AiEvent::Error { .. }) {
                self.state.lock().expect("run state").error_emitted = true;
            }
            // A gone consumer is the decorator's concern; keep draining so
            // the unit's final settles.
            let _ = self.events.send(event).await;
        }

        let outcome = outcome_rx
            .wait()
            .await
            .ok_or_else(|| ExecutionError::Internal("completion unit never settled".into()))??;

        let mut state = self.state.lock().expect("run state");
        if let Some(usage) = outcome.usage {
            state.usage.input_tokens += usage.input_tokens;
            state.usage.output_tokens += usage.output_tokens;
            state.has_usage = true;
        }
        state.finish_reason = Some(outcome.finish_reason);
        state.aborted = state.aborted || outcome.aborted;
        drop(state);

        Ok(outcome)
    }

    /// Invoke a tool under the run's policy.
    pub async fn call_tool(
        &self,
        tool_id: &str,
        call_id: Option<String>,
        args: serde_json::Value,
    ) -> ToolOutcome {
        self.tools.execute(tool_id, call_id, args, &self.events).await
    }
}

/// One graph's logic: composes completion units and tool calls into a final
/// assistant answer.
#[async_trait]
pub trait GraphLogic: Send + Sync {
    /// Run the graph to its final content.
    async fn run(&self, ctx: &GraphContext) -> Result<String, ExecutionError>;
}

/// Factory producing a fresh logic instance per run.
pub type GraphFactory = Arc<dyn Fn() -> Arc<dyn GraphLogic> + Send + Sync>;

struct CatalogEntry {
    description: String,
    factory: GraphFactory,
}

/// The simplest graph: one completion over the request messages.
pub struct SingleStepGraph;

#[async_trait]
impl GraphLogic for SingleStepGraph {
    async fn run(&self, ctx: &GraphContext) -> Result<String, ExecutionError> {
        let outcome = ctx.complete(ctx.messages().to_vec()).await?;
        Ok(outcome.content)
    }
}

/// In-process graph provider.
pub struct InProcessRunner {
    provider_id: String,
    unit: CompletionUnit,
    registry: Arc<ToolRegistry>,
    default_model: String,
    precharge_credits: i64,
    catalog: HashMap<String, CatalogEntry>,
}

impl InProcessRunner {
    /// Create a runner owning the given namespace.
    #[must_use]
    pub fn new(
        provider_id: impl Into<String>,
        unit: CompletionUnit,
        registry: Arc<ToolRegistry>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            unit,
            registry,
            default_model: default_model.into(),
            precharge_credits: 0,
            catalog: HashMap::new(),
        }
    }

    /// Credits the gate reserves before each step (zero still probes
    /// solvency).
    #[must_use]
    pub fn with_precharge(mut self, credits: i64) -> Self {
        self.precharge_credits = credits;
        self
    }

    /// Add a graph to the catalog.
    #[must_use]
    pub fn with_graph(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        factory: impl Fn() -> Arc<dyn GraphLogic> + Send + Sync + 'static,
    ) -> Self {
        self.catalog.insert(
            name.into(),
            CatalogEntry {
                description: description.into(),
                factory: Arc::new(factory),
            },
        );
        self
    }
}

#[async_trait]
impl GraphExecutor for InProcessRunner {
    async fn run_graph(&self, request: RunRequest) -> RunHandle {
        let run_id = request.run_id;
        let request_id = request.ingress_request_id.clone();

        let graph_ref = match GraphRef::parse(&request.graph_id) {
            Ok(graph_ref) => graph_ref,
            Err(e) => {
                let code = e.code();
                return error_run(run_id, request_id, code, e.to_string());
            }
        };

        let Some(entry) = self.catalog.get(&graph_ref.graph) else {
            let e = ExecutionError::GraphNotFound {
                graph_id: request.graph_id.clone(),
            };
            let code = e.code();
            return error_run(run_id, request_id, code, e.to_string());
        };

        let policy = request
            .tool_ids
            .as_ref()
            .map(|ids| ToolPolicy::allowing(ids.iter().cloned()));

        let (tx, rx) = mpsc::channel(RUN_EVENT_BUFFER);
        let (final_tx, final_rx) = deferred();

        let logic = (entry.factory)();
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let ctx = Arc::new(GraphContext {
            request,
            model,
            precharge_credits: self.precharge_credits,
            unit: self.unit.clone(),
            tools: ToolExecutor::new(self.registry.clone(), policy),
            events: tx.clone(),
            state: Mutex::new(RunState::default()),
        });

        tokio::spawn(async move {
            let result = logic.run(&ctx).await;

            let (usage, finish_reason, aborted, error_emitted) = {
                let state = ctx.state.lock().expect("run state");
                (
                    state.has_usage.then_some(state.usage),
                    state.finish_reason.unwrap_or(FinishReason::Stop),
                    state.aborted,
                    state.error_emitted,
                )
            };

            match result {
                Ok(content) => {
                    if aborted {
                        // Partial content after a cancel: no terminal
                        // events, the final carries what accumulated.
                        final_tx.settle(GraphFinal::Completed {
                            run_id,
                            request_id,
                            usage,
                            finish_reason: FinishReason::Aborted,
                            content: (!content.is_empty()).then_some(content),
                        });
                    } else {
                        let _ = tx
                            .send(AiEvent::AssistantFinal {
                                content: content.clone(),
                            })
                            .await;
                        let _ = tx.send(AiEvent::Done).await;
                        final_tx.settle(GraphFinal::Completed {
                            run_id,
                            request_id,
                            usage,
                            finish_reason,
                            content: Some(content),
                        });
                    }
                }
                Err(e) => {
                    let code = e.code();
                    // Pre-call gate refusals keep the stream empty; the
                    // final alone carries the failure. Mid-stream provider
                    // failures already put one error event on the stream;
                    // don't double it.
                    if code == cogni_core::ExecutionErrorCode::InsufficientCredits {
                        final_tx.settle(GraphFinal::Failed {
                            run_id,
                            request_id,
                            error: code,
                        });
                        return;
                    }
                    if !error_emitted {
                        let _ = tx
                            .send(AiEvent::Error {
                                code,
                                message: e.to_string(),
                            })
                            .await;
                    }
                    let _ = tx.send(AiEvent::Done).await;
                    final_tx.settle(GraphFinal::Failed {
                        run_id,
                        request_id,
                        error: code,
                    });
                }
            }
        });

        RunHandle { events: rx, final_rx }
    }

    fn list_graphs(&self) -> Vec<GraphCatalogEntry> {
        let mut graphs: Vec<_> = self
            .catalog
            .iter()
            .map(|(name, entry)| GraphCatalogEntry {
                graph_id: format!("{}:{name}", self.provider_id),
                description: entry.description.clone(),
            })
            .collect();
        graphs.sort_by(|a, b| a.graph_id.cmp(&b.graph_id));
        graphs
    }
}

#[async_trait]
impl GraphProvider for InProcessRunner {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn can_handle(&self, graph_id: &str) -> bool {
        graph_id
            .split_once(':')
            .is_some_and(|(provider, _)| provider == self.provider_id)
    }
}
