//! The normalized run event stream.
//!
//! Every graph provider, whatever its internals, emits this one event shape.
//! Ordering contract per run: at most one `done`; any `usage_report`
//! precedes it; at most one `assistant_final`; `error` ends the useful
//! portion of the stream.

use serde::{Deserialize, Serialize};

use crate::{ExecutionErrorCode, UsageFact};

/// A single element of a run's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AiEvent {
    /// Incremental assistant text.
    TextDelta {
        /// The text fragment.
        text: String,
    },

    /// A tool invocation began.
    ToolCallStart {
        /// Stable id linking start to result.
        tool_call_id: String,
        /// Tool being invoked.
        tool_name: String,
        /// Validated input payload.
        args: serde_json::Value,
    },

    /// A tool invocation finished.
    ToolCallResult {
        /// Id from the matching `ToolCallStart`.
        tool_call_id: String,
        /// Tool that was invoked.
        tool_name: String,
        /// Redacted output payload.
        output: serde_json::Value,
        /// Whether the tool failed (including redaction failures).
        is_error: bool,
    },

    /// One normalized usage fact for one LLM call.
    UsageReport {
        /// The fact to settle against the ledger.
        fact: UsageFact,
    },

    /// The final assistant content for the run.
    AssistantFinal {
        /// Complete assistant output.
        content: String,
    },

    /// The run failed; no further useful events follow.
    Error {
        /// Stable error code.
        code: ExecutionErrorCode,
        /// Human-readable detail, content-free.
        message: String,
    },

    /// Terminal event. Exactly one per run.
    Done,
}

impl AiEvent {
    /// Whether this event terminates the stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_tag_by_type() {
        let json = serde_json::to_value(AiEvent::TextDelta {
            text: "hi".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "text_delta");
        assert_eq!(json["text"], "hi");

        let json = serde_json::to_value(AiEvent::Done).unwrap();
        assert_eq!(json["type"], "done");
    }

    #[test]
    fn error_event_carries_stable_code() {
        let json = serde_json::to_value(AiEvent::Error {
            code: ExecutionErrorCode::Internal,
            message: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "internal");
    }

    #[test]
    fn done_is_terminal() {
        assert!(AiEvent::Done.is_terminal());
        assert!(!AiEvent::TextDelta { text: String::new() }.is_terminal());
    }
}
