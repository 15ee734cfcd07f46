//! Wire types for the OpenAI-compatible proxy endpoint.

use serde::{Deserialize, Serialize};

use cogni_core::{ChatMessage, FinishReason};

/// Response header carrying the provider cost in USD.
pub const COST_HEADER: &str = "x-litellm-response-cost";

/// Response header carrying the provider call id.
pub const CALL_ID_HEADER: &str = "x-litellm-call-id";

/// A chat completion request.
///
/// Tenant identity rides in `user` and `metadata`; authentication is always
/// the process-wide master key, never a per-user secret.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Model to invoke.
    pub model: String,

    /// Conversation so far.
    pub messages: Vec<ChatMessage>,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Output token cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// End-user attribution for upstream spend accounting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Correlation metadata (run id, trace id, request id).
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,

    /// Whether to stream the response.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,

    /// Stream options; set when streaming so usage arrives in-band.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

/// Streaming options.
#[derive(Debug, Clone, Serialize)]
pub struct StreamOptions {
    /// Ask for a final usage chunk.
    pub include_usage: bool,
}

/// A non-streaming chat completion response.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    /// Provider completion id (call-id fallback).
    #[serde(default)]
    pub id: Option<String>,

    /// Model that served the call.
    #[serde(default)]
    pub model: Option<String>,

    /// Completion choices.
    #[serde(default)]
    pub choices: Vec<Choice>,

    /// Token usage.
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// One completion choice.
#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    /// The assistant message.
    pub message: ResponseMessage,

    /// Why generation stopped.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Assistant message payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    /// Message text.
    #[serde(default)]
    pub content: Option<String>,
}

/// Token usage block; on streams this arrives in the final chunk.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Usage {
    /// Prompt tokens.
    #[serde(default)]
    pub prompt_tokens: Option<u64>,

    /// Completion tokens.
    #[serde(default)]
    pub completion_tokens: Option<u64>,

    /// Proxy-reported cost when it rides in the usage event instead of the
    /// header.
    #[serde(default)]
    pub response_cost: Option<f64>,
}

/// One streaming chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamChunk {
    /// Provider completion id; the first chunk's id is the call-id
    /// fallback.
    #[serde(default)]
    pub id: Option<String>,

    /// Model that served the call.
    #[serde(default)]
    pub model: Option<String>,

    /// Delta choices.
    #[serde(default)]
    pub choices: Vec<StreamChoice>,

    /// Usage block, present on the final chunk when requested.
    #[serde(default)]
    pub usage: Option<Usage>,

    /// Provider-reported error payload.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// One streaming choice delta.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamChoice {
    /// Incremental content.
    #[serde(default)]
    pub delta: Option<StreamDelta>,

    /// Why generation stopped, on the closing chunk.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Incremental delta payload.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamDelta {
    /// Text fragment.
    #[serde(default)]
    pub content: Option<String>,
}

/// The resolved result of one completion call.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    /// Full assistant content (partial when `aborted`).
    pub content: String,

    /// Provider call id. Always present on a non-aborted success; the
    /// transport rejects the final otherwise.
    pub call_id: Option<String>,

    /// Provider cost in USD when reported.
    pub cost_usd: Option<f64>,

    /// Prompt tokens when reported.
    pub input_tokens: Option<u64>,

    /// Completion tokens when reported.
    pub output_tokens: Option<u64>,

    /// Model that served the call.
    pub model: Option<String>,

    /// Why generation stopped.
    pub finish_reason: FinishReason,

    /// Whether the caller aborted mid-stream; content is the partial
    /// accumulation and abort is not an error.
    pub aborted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_omits_stream_fields_when_off() {
        let req = ChatRequest {
            model: "gpt-test".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: None,
            max_tokens: None,
            user: None,
            metadata: serde_json::Value::Null,
            stream: false,
            stream_options: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("stream").is_none());
        assert!(json.get("stream_options").is_none());
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn stream_request_asks_for_usage() {
        let req = ChatRequest {
            model: "gpt-test".into(),
            messages: vec![],
            temperature: Some(0.7),
            max_tokens: Some(256),
            user: Some("acct-1".into()),
            metadata: serde_json::json!({"run_id": "r1"}),
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);
    }

    #[test]
    fn chunk_parses_with_missing_fields() {
        let chunk: StreamChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"hi"}}]}"#).unwrap();
        assert_eq!(
            chunk.choices[0].delta.as_ref().unwrap().content.as_deref(),
            Some("hi")
        );
        assert!(chunk.id.is_none());
        assert!(chunk.usage.is_none());
    }
}
