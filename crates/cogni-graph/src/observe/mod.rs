//! The observability decorator.
//!
//! Wraps any executor so every run gets exactly one trace with exactly one
//! terminal resolution. Terminal states:
//!
//! ```text
//!  created --assistant_final--> awaiting_done --done--> success
//!          \--done w/o final---> finalization_armed --timer-->  finalization_lost
//!                                                    --stream err--> error
//!          \--error-------> error
//!          \--abort-------> aborted
//! ```
//!
//! The once-guard makes whichever transition fires first win; the trace
//! update and flush happen in the background and never block the request.

pub mod scrub;
pub mod trace;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};

use cogni_core::{
    AiEvent, ExecutionErrorCode, FinishReason, GraphFinal, RunRequest, TraceId,
};
use cogni_llm::deferred;

use crate::provider::{GraphCatalogEntry, GraphExecutor};
use crate::stream::{RunHandle, RUN_EVENT_BUFFER};

pub use scrub::Scrubber;
pub use trace::{
    HttpTraceSink, NoopTraceSink, TerminalOutcome, TraceRecord, TraceSink, TraceSinkError,
    TraceUpdate,
};

/// Default grace period between stream end and `finalization_lost`.
pub const FINALIZATION_GRACE: Duration = Duration::from_secs(15);

/// What the stream observer has seen so far.
#[derive(Debug, Default)]
struct Observation {
    captured_content: Option<String>,
    saw_assistant_final: bool,
    error_code: Option<ExecutionErrorCode>,
}

/// Shared terminal-resolution machinery.
struct Terminal {
    once: AtomicBool,
    trace_id: TraceId,
    sink: Arc<dyn TraceSink>,
    scrubber: Arc<Scrubber>,
    mask_content: bool,
}

impl Terminal {
    /// Resolve the trace terminal. First caller wins; the write happens in
    /// the background and failures are logged and swallowed.
    fn resolve(
        self: &Arc<Self>,
        outcome: TerminalOutcome,
        error_code: Option<ExecutionErrorCode>,
        content: Option<&str>,
    ) {
        if self.once.swap(true, Ordering::SeqCst) {
            return;
        }

        let output = if self.mask_content {
            serde_json::json!({ "masked": true })
        } else {
            match (outcome, content) {
                (TerminalOutcome::Success | TerminalOutcome::Aborted, Some(content)) => {
                    serde_json::json!({ "content": self.scrubber.scrub_text(content) })
                }
                _ => serde_json::json!({ "error": error_code }),
            }
        };

        let update = TraceUpdate {
            trace_id: self.trace_id.clone(),
            outcome,
            error_code,
            output,
            ended_at: Utc::now(),
        };

        let sink = self.sink.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.update_trace(update).await {
                tracing::warn!(error = %e, "Trace terminal write failed");
            }
            if let Err(e) = sink.flush().await {
                tracing::debug!(error = %e, "Trace flush failed");
            }
        });
    }
}

/// Executor decorator attaching every run to a distributed trace.
pub struct ObservedExecutor {
    inner: Arc<dyn GraphExecutor>,
    sink: Arc<dyn TraceSink>,
    scrubber: Arc<Scrubber>,
    finalization_grace: Duration,
}

impl ObservedExecutor {
    /// Wrap an executor.
    #[must_use]
    pub fn new(inner: Arc<dyn GraphExecutor>, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            inner,
            sink,
            scrubber: Arc::new(Scrubber::default()),
            finalization_grace: FINALIZATION_GRACE,
        }
    }

    /// Override the finalization-lost grace period (tests).
    #[must_use]
    pub fn with_finalization_grace(mut self, grace: Duration) -> Self {
        self.finalization_grace = grace;
        self
    }
}

#[async_trait]
impl GraphExecutor for ObservedExecutor {
    async fn run_graph(&self, mut request: RunRequest) -> RunHandle {
        let trace_id = request
            .caller
            .trace_id
            .clone()
            .unwrap_or_else(TraceId::generate);
        request.caller.trace_id = Some(trace_id.clone());

        let run_id = request.run_id;
        let request_id = request.ingress_request_id.clone();
        let mask_content = request.caller.mask_content;

        let input = if mask_content {
            serde_json::json!({ "masked": true })
        } else {
            self.scrubber.scrub(
                &serde_json::to_value(&request.messages).unwrap_or(serde_json::Value::Null),
            )
        };

        if let Err(e) = self
            .sink
            .create_trace(TraceRecord {
                trace_id: trace_id.clone(),
                run_id,
                graph_id: request.graph_id.clone(),
                session_id: request.caller.session_id.clone(),
                user_id: request.caller.user_id.clone(),
                input,
                started_at: Utc::now(),
            })
            .await
        {
            tracing::warn!(error = %e, trace_id = %trace_id, "Trace create failed");
        }

        let inner_handle = self.inner.run_graph(request).await;

        let terminal = Arc::new(Terminal {
            once: AtomicBool::new(false),
            trace_id,
            sink: self.sink.clone(),
            scrubber: self.scrubber.clone(),
            mask_content,
        });
        let observation = Arc::new(Mutex::new(Observation::default()));

        let (tx, rx) = mpsc::channel(RUN_EVENT_BUFFER);
        let (final_tx, final_rx) = deferred();
        let (closed_tx, closed_rx) = watch::channel(false);

        // Stream observer: forwards events, captures content, and resolves
        // success on a clean assistant_final → done sequence.
        {
            let terminal = terminal.clone();
            let observation = observation.clone();
            let mut inner_events = inner_handle.events;
            tokio::spawn(async move {
                while let Some(event) = inner_events.recv().await {
                    let mut done = false;
                    {
                        let mut obs = observation.lock().expect("observation");
                        match &event {
                            AiEvent::AssistantFinal { content } => {
                                obs.captured_content = Some(content.clone());
                                obs.saw_assistant_final = true;
                            }
                            AiEvent::Error { code, .. } => {
                                obs.error_code = Some(*code);
                            }
                            AiEvent::Done => done = true,
                            _ => {}
                        }
                    }

                    if done {
                        let obs = observation.lock().expect("observation");
                        if let Some(code) = obs.error_code {
                            terminal.resolve(TerminalOutcome::Error, Some(code), None);
                        } else if obs.saw_assistant_final {
                            terminal.resolve(
                                TerminalOutcome::Success,
                                None,
                                obs.captured_content.as_deref(),
                            );
                        }
                        // done without assistant_final: the grace timer in
                        // the final observer arms via the closed signal.
                    }

                    if tx.send(event).await.is_err() {
                        // Consumer stopped early; same timer path.
                        break;
                    }
                }
                let _ = closed_tx.send(true);
            });
        }

        // Final observer: maps the inner final to the terminal state, or
        // declares finalization lost when the stream ended and no final
        // arrives within the grace period.
        {
            let terminal = terminal.clone();
            let observation = observation.clone();
            let grace = self.finalization_grace;
            let mut closed_rx = closed_rx;
            tokio::spawn(async move {
                let final_fut = inner_handle.final_rx.wait();
                tokio::pin!(final_fut);

                let resolved = tokio::select! {
                    resolved = &mut final_fut => Some(resolved),
                    () = async {
                        while !*closed_rx.borrow() {
                            if closed_rx.changed().await.is_err() {
                                break;
                            }
                        }
                        tokio::time::sleep(grace).await;
                    } => None,
                };

                match resolved {
                    Some(Some(final_value)) => {
                        let out_final = finish(&terminal, &observation, final_value);
                        final_tx.settle(out_final);
                    }
                    Some(None) => {
                        terminal.resolve(
                            TerminalOutcome::Error,
                            Some(ExecutionErrorCode::Internal),
                            None,
                        );
                        final_tx.settle(GraphFinal::Failed {
                            run_id,
                            request_id,
                            error: ExecutionErrorCode::Internal,
                        });
                    }
                    None => {
                        tracing::warn!(run_id = %run_id, "Run finalization lost");
                        terminal.resolve(TerminalOutcome::FinalizationLost, None, None);
                        final_tx.settle(GraphFinal::Failed {
                            run_id,
                            request_id,
                            error: ExecutionErrorCode::Internal,
                        });
                    }
                }
            });
        }

        RunHandle { events: rx, final_rx }
    }

    fn list_graphs(&self) -> Vec<GraphCatalogEntry> {
        self.inner.list_graphs()
    }
}

/// Map a resolved inner final to the trace terminal and the outgoing final.
fn finish(
    terminal: &Arc<Terminal>,
    observation: &Arc<Mutex<Observation>>,
    final_value: GraphFinal,
) -> GraphFinal {
    let captured = observation
        .lock()
        .expect("observation")
        .captured_content
        .clone();

    match final_value {
        GraphFinal::Completed {
            run_id,
            request_id,
            usage,
            finish_reason,
            content,
        } => {
            // The final's content wins over stream-captured content.
            let content = content.or(captured);
            let outcome = if finish_reason == FinishReason::Aborted {
                TerminalOutcome::Aborted
            } else {
                TerminalOutcome::Success
            };
            terminal.resolve(outcome, None, content.as_deref());
            GraphFinal::Completed {
                run_id,
                request_id,
                usage,
                finish_reason,
                content,
            }
        }
        GraphFinal::Failed {
            run_id,
            request_id,
            error,
        } => {
            let outcome = if error == ExecutionErrorCode::Aborted {
                TerminalOutcome::Aborted
            } else {
                TerminalOutcome::Error
            };
            terminal.resolve(outcome, Some(error), None);
            GraphFinal::Failed {
                run_id,
                request_id,
                error,
            }
        }
    }
}
