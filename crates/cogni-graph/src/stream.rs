//! Run stream plumbing.
//!
//! A run hands its consumer a `(stream, final)` pair: a bounded channel of
//! [`AiEvent`]s and a single-settle promise of the [`GraphFinal`]. The pair
//! is produced synchronously; execution proceeds as the consumer drains the
//! channel.

use tokio::sync::mpsc;

use cogni_core::{AiEvent, ExecutionErrorCode, GraphFinal, RunId};
use cogni_llm::{deferred, Promise};

/// Depth of the run-level event channel.
pub const RUN_EVENT_BUFFER: usize = 64;

/// The consumable half of a run.
#[derive(Debug)]
pub struct RunHandle {
    /// The run's event stream. Must be drained or dropped; dropping aborts
    /// upstream production.
    pub events: mpsc::Receiver<AiEvent>,

    /// The run's final. Independent of stream consumption; resolves exactly
    /// once. Never await this inside a loop over `events`.
    pub final_rx: Promise<GraphFinal>,
}

/// A finished run whose stream carries nothing: pre-call failures.
#[must_use]
pub fn empty_run(final_value: GraphFinal) -> RunHandle {
    let (_tx, events) = mpsc::channel(1);
    let (final_tx, final_rx) = deferred();
    final_tx.settle(final_value);
    RunHandle { events, final_rx }
}

/// A synthesized failure run: stream yields `[error, done]` and the final
/// fails with the same code.
#[must_use]
pub fn error_run(
    run_id: RunId,
    request_id: String,
    code: ExecutionErrorCode,
    message: String,
) -> RunHandle {
    let (tx, events) = mpsc::channel(2);
    // Capacity 2 holds both events, so the sends cannot fail.
    let _ = tx.try_send(AiEvent::Error {
        code,
        message,
    });
    let _ = tx.try_send(AiEvent::Done);

    let (final_tx, final_rx) = deferred();
    final_tx.settle(GraphFinal::Failed {
        run_id,
        request_id,
        error: code,
    });

    RunHandle { events, final_rx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cogni_core::FinishReason;

    #[tokio::test]
    async fn empty_run_has_no_events() {
        let run_id = RunId::generate();
        let mut handle = empty_run(GraphFinal::Completed {
            run_id,
            request_id: "req".into(),
            usage: None,
            finish_reason: FinishReason::Stop,
            content: None,
        });

        assert!(handle.events.recv().await.is_none());
        assert!(handle.final_rx.wait().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn error_run_yields_error_then_done() {
        let run_id = RunId::generate();
        let mut handle = error_run(
            run_id,
            "req".into(),
            ExecutionErrorCode::Internal,
            "no provider".into(),
        );

        assert!(matches!(
            handle.events.recv().await,
            Some(AiEvent::Error {
                code: ExecutionErrorCode::Internal,
                ..
            })
        ));
        assert!(matches!(handle.events.recv().await, Some(AiEvent::Done)));
        assert!(handle.events.recv().await.is_none());

        let final_value = handle.final_rx.wait().await.unwrap();
        assert_eq!(
            final_value.error_code(),
            Some(ExecutionErrorCode::Internal)
        );
    }
}
