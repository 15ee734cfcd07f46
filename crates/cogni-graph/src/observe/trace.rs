//! Trace sink: where run traces land.
//!
//! The sink is write-only and best-effort: failures are logged by the
//! decorator and never fail the request path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use cogni_core::{ExecutionErrorCode, RunId, TraceId};

/// Result type for sink operations.
pub type SinkResult = Result<(), TraceSinkError>;

/// Terminal outcome of a traced run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalOutcome {
    /// The run completed.
    Success,
    /// The run failed with a classified code.
    Error,
    /// The caller cancelled the run.
    Aborted,
    /// The stream closed without a definitive success or error.
    FinalizationLost,
}

impl TerminalOutcome {
    /// The outcome as a stable string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Aborted => "aborted",
            Self::FinalizationLost => "finalization_lost",
        }
    }
}

/// Trace creation payload: one per run, input already scrubbed.
#[derive(Debug, Clone, Serialize)]
pub struct TraceRecord {
    /// 32-hex trace id.
    pub trace_id: TraceId,

    /// The run being traced.
    pub run_id: RunId,

    /// Namespaced graph id.
    pub graph_id: String,

    /// Conversation session when tracked.
    pub session_id: Option<String>,

    /// End-user id when known.
    pub user_id: Option<String>,

    /// Scrubbed input payload.
    pub input: serde_json::Value,

    /// When the run started.
    pub started_at: DateTime<Utc>,
}

/// Terminal trace update: exactly one per run.
#[derive(Debug, Clone, Serialize)]
pub struct TraceUpdate {
    /// 32-hex trace id.
    pub trace_id: TraceId,

    /// How the run ended.
    pub outcome: TerminalOutcome,

    /// Error code when the outcome is an error.
    pub error_code: Option<ExecutionErrorCode>,

    /// Scrubbed output payload.
    pub output: serde_json::Value,

    /// When the run ended.
    pub ended_at: DateTime<Utc>,
}

/// Errors from a trace sink.
#[derive(Debug, thiserror::Error)]
pub enum TraceSinkError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The sink API returned an error.
    #[error("sink error: {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response detail.
        message: String,
    },
}

/// A destination for run traces.
#[async_trait]
pub trait TraceSink: Send + Sync {
    /// Record the start of a run.
    async fn create_trace(&self, record: TraceRecord) -> SinkResult;

    /// Record the terminal state of a run.
    async fn update_trace(&self, update: TraceUpdate) -> SinkResult;

    /// Push buffered writes out.
    async fn flush(&self) -> SinkResult;
}

/// Sink that drops everything; used when no tracing backend is configured.
pub struct NoopTraceSink;

#[async_trait]
impl TraceSink for NoopTraceSink {
    async fn create_trace(&self, _record: TraceRecord) -> SinkResult {
        Ok(())
    }

    async fn update_trace(&self, _update: TraceUpdate) -> SinkResult {
        Ok(())
    }

    async fn flush(&self) -> SinkResult {
        Ok(())
    }
}

/// Batch-ingestion HTTP sink (Langfuse-compatible wire shape).
#[derive(Debug, Clone)]
pub struct HttpTraceSink {
    client: reqwest::Client,
    base_url: String,
    public_key: String,
    secret_key: String,
}

#[derive(Serialize)]
struct IngestionBatch {
    batch: Vec<IngestionEvent>,
}

#[derive(Serialize)]
struct IngestionEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: &'static str,
    timestamp: DateTime<Utc>,
    body: serde_json::Value,
}

impl HttpTraceSink {
    /// Create a new sink.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be built (should not happen with
    /// default settings).
    pub fn new(
        base_url: impl Into<String>,
        public_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            public_key: public_key.into(),
            secret_key: secret_key.into(),
        }
    }

    async fn send_batch(&self, events: Vec<IngestionEvent>) -> SinkResult {
        let url = format!("{}/api/public/ingestion", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .json(&IngestionBatch { batch: events })
            .send()
            .await?;

        let status = response.status();
        // 207 means partial acceptance, which is fine for best-effort
        // telemetry.
        if status.is_success() {
            return Ok(());
        }

        Err(TraceSinkError::Api {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl TraceSink for HttpTraceSink {
    async fn create_trace(&self, record: TraceRecord) -> SinkResult {
        let body = serde_json::json!({
            "id": record.trace_id,
            "name": record.graph_id,
            "input": record.input,
            "sessionId": record.session_id,
            "userId": record.user_id,
            "timestamp": record.started_at,
            "metadata": { "run_id": record.run_id },
        });

        self.send_batch(vec![IngestionEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: "trace-create",
            timestamp: record.started_at,
            body,
        }])
        .await
    }

    async fn update_trace(&self, update: TraceUpdate) -> SinkResult {
        let body = serde_json::json!({
            "id": update.trace_id,
            "output": update.output,
            "metadata": {
                "outcome": update.outcome.as_str(),
                "error_code": update.error_code,
            },
        });

        self.send_batch(vec![IngestionEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: "trace-create",
            timestamp: update.ended_at,
            body,
        }])
        .await
    }

    async fn flush(&self) -> SinkResult {
        // Batches post synchronously; nothing is buffered.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_strings_are_stable() {
        assert_eq!(TerminalOutcome::Success.as_str(), "success");
        assert_eq!(
            TerminalOutcome::FinalizationLost.as_str(),
            "finalization_lost"
        );
    }
}
