//! Run requests, graph references, and run finals.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    BillingAccountId, ChatMessage, ExecutionError, ExecutionErrorCode, RunId, TraceId,
    VirtualKeyId,
};

/// Identity and correlation context for the caller of a run.
#[derive(Debug, Clone)]
pub struct RunCaller {
    /// The account being charged.
    pub billing_account_id: BillingAccountId,

    /// The scope key the run executes under.
    pub virtual_key_id: VirtualKeyId,

    /// Trace to attach the run to; generated when absent.
    pub trace_id: Option<TraceId>,

    /// Conversation session, when the ingress tracks one.
    pub session_id: Option<String>,

    /// End-user id for upstream attribution.
    pub user_id: Option<String>,

    /// Whether trace input/output must be masked rather than scrubbed.
    pub mask_content: bool,
}

/// A parsed, namespaced graph reference: `<provider>:<graph>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphRef {
    /// Provider namespace (e.g. `langgraph`).
    pub provider: String,

    /// Graph name within the namespace (e.g. `poet`).
    pub graph: String,
}

impl GraphRef {
    /// Parse a namespaced graph id.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::InvalidGraphId` when the id is not of the
    /// form `<provider>:<graph>` with both parts non-empty.
    pub fn parse(graph_id: &str) -> Result<Self, ExecutionError> {
        match graph_id.split_once(':') {
            Some((provider, graph)) if !provider.is_empty() && !graph.is_empty() => Ok(Self {
                provider: provider.to_string(),
                graph: graph.to_string(),
            }),
            _ => Err(ExecutionError::InvalidGraphId {
                graph_id: graph_id.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for GraphRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider, self.graph)
    }
}

/// One graph execution request.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Unique run id.
    pub run_id: RunId,

    /// Ingress request id for delivery correlation.
    pub ingress_request_id: String,

    /// Namespaced graph id.
    pub graph_id: String,

    /// Conversation so far.
    pub messages: Vec<ChatMessage>,

    /// Model override; providers fall back to their configured default.
    pub model: Option<String>,

    /// Caller identity and correlation.
    pub caller: RunCaller,

    /// Tools the caller enables for this run. `None` means no tools.
    pub tool_ids: Option<Vec<String>>,

    /// Cancellation signal threaded through every I/O call.
    pub cancel: CancellationToken,
}

/// Why a completion stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of output.
    Stop,
    /// Output hit the token limit.
    Length,
    /// The model requested tool calls.
    ToolCalls,
    /// Provider content filter fired.
    ContentFilter,
    /// The caller aborted; partial content was kept.
    Aborted,
    /// The provider did not say.
    Unknown,
}

impl FinishReason {
    /// Parse a provider-reported finish reason string.
    #[must_use]
    pub fn from_provider(reason: &str) -> Self {
        match reason {
            "stop" => Self::Stop,
            "length" => Self::Length,
            "tool_calls" => Self::ToolCalls,
            "content_filter" => Self::ContentFilter,
            _ => Self::Unknown,
        }
    }
}

/// Aggregate token usage for a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    /// Total prompt tokens.
    pub input_tokens: u64,

    /// Total completion tokens.
    pub output_tokens: u64,
}

/// The terminal result of a run, independent of its stream.
///
/// Resolves exactly once, whether or not the stream was drained.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "ok")]
pub enum GraphFinal {
    /// The run completed (possibly with partial content after an abort).
    #[serde(rename = "true")]
    Completed {
        /// The run id.
        run_id: RunId,
        /// Ingress request id.
        request_id: String,
        /// Aggregate usage when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<UsageTotals>,
        /// Why the run stopped.
        finish_reason: FinishReason,
        /// Final assistant content when any was produced.
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    /// The run failed with a classified code.
    #[serde(rename = "false")]
    Failed {
        /// The run id.
        run_id: RunId,
        /// Ingress request id.
        request_id: String,
        /// Stable error code.
        error: ExecutionErrorCode,
    },
}

impl GraphFinal {
    /// Whether the run completed.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// The final content, when the run completed with content.
    #[must_use]
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Completed { content, .. } => content.as_deref(),
            Self::Failed { .. } => None,
        }
    }

    /// The error code, when the run failed.
    #[must_use]
    pub const fn error_code(&self) -> Option<ExecutionErrorCode> {
        match self {
            Self::Completed { .. } => None,
            Self::Failed { error, .. } => Some(*error),
        }
    }
}
