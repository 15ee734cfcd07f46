//! LLM proxy client.
//!
//! Single-shot and streaming chat against the internal LiteLLM proxy. Both
//! paths authenticate with the process-wide master key and extract the
//! provider cost and call id from response metadata; the call id is what
//! settlement joins on, so a successful stream without one is a hard error.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cogni_core::{AiEvent, ChatMessage, ExecutionErrorCode, FinishReason};

use crate::deferred::{deferred, Deferred, Promise};
use crate::error::{Result, TransportError};
use crate::sse::{SseDecoder, SseFrame};
use crate::types::{
    ChatRequest, ChatResponse, CompletionOutcome, StreamChunk, StreamOptions, CALL_ID_HEADER,
    COST_HEADER,
};

/// Budget for response headers (time to first byte) on streams.
const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(15);

/// Total budget for a single-shot completion.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

/// Event channel depth between the decode task and the consumer.
const EVENT_BUFFER: usize = 64;

/// Longest upstream error body kept in messages.
const ERROR_BODY_LIMIT: usize = 500;

/// Input for one completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Conversation so far.
    pub messages: Vec<ChatMessage>,

    /// Model to invoke.
    pub model: String,

    /// Sampling temperature.
    pub temperature: Option<f32>,

    /// Output token cap.
    pub max_tokens: Option<u32>,

    /// End-user attribution for upstream spend accounting.
    pub end_user: Option<String>,

    /// Correlation metadata (run id, trace id, request id).
    pub metadata: serde_json::Value,
}

/// Client for the internal LLM proxy.
#[derive(Debug, Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    master_key: String,
}

impl LlmClient {
    /// Create a new client.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be built (should not happen with
    /// default settings).
    pub fn new(base_url: impl Into<String>, master_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            master_key: master_key.into(),
        }
    }

    /// The proxy base URL this client talks to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn master_key(&self) -> &str {
        &self.master_key
    }

    fn chat_body(&self, req: &CompletionRequest, stream: bool) -> ChatRequest {
        ChatRequest {
            model: req.model.clone(),
            messages: req.messages.clone(),
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            user: req.end_user.clone(),
            metadata: req.metadata.clone(),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    /// Single-shot completion.
    ///
    /// # Errors
    ///
    /// Returns a transport error on HTTP failure, non-success status, or a
    /// success response missing the provider call id.
    pub async fn completion(&self, req: &CompletionRequest) -> Result<CompletionOutcome> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.chat_body(req, false);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.master_key)
            .timeout(COMPLETION_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Api {
                status: status.as_u16(),
                message: truncate_body(&message),
            });
        }

        let cost_usd = header_f64(response.headers(), COST_HEADER);
        let header_call_id = header_string(response.headers(), CALL_ID_HEADER);

        let parsed: ChatResponse = response.json().await?;

        let call_id = header_call_id
            .or_else(|| parsed.id.clone())
            .ok_or(TransportError::MissingCallId)?;

        let (content, finish_reason) = parsed
            .choices
            .first()
            .map(|choice| {
                (
                    choice.message.content.clone().unwrap_or_default(),
                    choice
                        .finish_reason
                        .as_deref()
                        .map_or(FinishReason::Unknown, FinishReason::from_provider),
                )
            })
            .unwrap_or((String::new(), FinishReason::Unknown));

        Ok(CompletionOutcome {
            content,
            call_id: Some(call_id),
            cost_usd: cost_usd.or_else(|| parsed.usage.and_then(|u| u.response_cost)),
            input_tokens: parsed.usage.and_then(|u| u.prompt_tokens),
            output_tokens: parsed.usage.and_then(|u| u.completion_tokens),
            model: parsed.model,
            finish_reason,
            aborted: false,
        })
    }

    /// Streaming completion.
    ///
    /// Returns a lazy event sequence (`text_delta | error | done`) and a
    /// deferred final that settles exactly once. Abort resolves the final
    /// `Ok` with whatever partial content accumulated; it is not an error
    /// here.
    ///
    /// # Errors
    ///
    /// Returns a transport error when cancellation fires or no response
    /// arrives before the first-byte budget, or on a non-success status.
    pub async fn completion_stream(
        &self,
        req: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<(
        mpsc::Receiver<AiEvent>,
        Promise<Result<CompletionOutcome>>,
    )> {
        if cancel.is_cancelled() {
            return Err(TransportError::Aborted);
        }

        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.chat_body(req, true);

        let send = self
            .client
            .post(&url)
            .bearer_auth(&self.master_key)
            .json(&body)
            .send();

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(TransportError::Aborted),
            outcome = tokio::time::timeout(FIRST_BYTE_TIMEOUT, send) => match outcome {
                Err(_) => return Err(TransportError::FirstByteTimeout),
                Ok(result) => result?,
            },
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Api {
                status: status.as_u16(),
                message: truncate_body(&message),
            });
        }

        let state = StreamState {
            content: String::new(),
            call_id: header_string(response.headers(), CALL_ID_HEADER),
            cost_usd: header_f64(response.headers(), COST_HEADER),
            input_tokens: None,
            output_tokens: None,
            model: None,
            finish_reason: FinishReason::Unknown,
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (final_tx, final_rx) = deferred();

        tokio::spawn(decode_stream(response, state, tx, final_tx, cancel));

        Ok((rx, final_rx))
    }
}

/// Accumulator for a streaming completion.
struct StreamState {
    content: String,
    call_id: Option<String>,
    cost_usd: Option<f64>,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    model: Option<String>,
    finish_reason: FinishReason,
}

impl StreamState {
    /// Fold one chunk in, returning any text delta to forward.
    fn absorb(&mut self, chunk: StreamChunk) -> Option<String> {
        if self.call_id.is_none() {
            self.call_id = chunk.id;
        }
        if self.model.is_none() {
            self.model = chunk.model;
        }
        if let Some(usage) = chunk.usage {
            self.input_tokens = usage.prompt_tokens.or(self.input_tokens);
            self.output_tokens = usage.completion_tokens.or(self.output_tokens);
            if self.cost_usd.is_none() {
                self.cost_usd = usage.response_cost;
            }
        }

        let choice = chunk.choices.into_iter().next()?;
        if let Some(reason) = choice.finish_reason.as_deref() {
            self.finish_reason = FinishReason::from_provider(reason);
        }
        let delta = choice.delta?.content?;
        if delta.is_empty() {
            return None;
        }
        self.content.push_str(&delta);
        Some(delta)
    }

    fn outcome(self, aborted: bool) -> CompletionOutcome {
        CompletionOutcome {
            content: self.content,
            call_id: self.call_id,
            cost_usd: self.cost_usd,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            model: self.model,
            finish_reason: if aborted {
                FinishReason::Aborted
            } else {
                self.finish_reason
            },
            aborted,
        }
    }

    /// Resolve a normally-completed stream: a call id is mandatory.
    fn resolve(self) -> Result<CompletionOutcome> {
        if self.call_id.is_none() {
            return Err(TransportError::MissingCallId);
        }
        Ok(self.outcome(false))
    }
}

/// Decode task: reads the SSE body, forwards deltas, and settles the final.
///
/// The final settles here, in the stream-completion path, never inside the
/// consumer's iteration.
async fn decode_stream(
    response: reqwest::Response,
    mut state: StreamState,
    tx: mpsc::Sender<AiEvent>,
    final_tx: Arc<Deferred<Result<CompletionOutcome>>>,
    cancel: CancellationToken,
) {
    let mut bytes = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Stream cancelled; resolving final with partial content");
                final_tx.settle(Ok(state.outcome(true)));
                return;
            }
            next = bytes.next() => next,
        };

        let Some(chunk) = next else {
            // Connection closed without a [DONE] marker; resolve as done.
            let _ = tx.send(AiEvent::Done).await;
            final_tx.settle(state.resolve());
            return;
        };

        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let message = e.to_string();
                let _ = tx
                    .send(AiEvent::Error {
                        code: ExecutionErrorCode::Internal,
                        message: message.clone(),
                    })
                    .await;
                final_tx.settle(Err(TransportError::Stream(message)));
                return;
            }
        };

        for frame in decoder.push(&chunk) {
            match frame {
                SseFrame::Done => {
                    let _ = tx.send(AiEvent::Done).await;
                    final_tx.settle(state.resolve());
                    return;
                }
                SseFrame::Data(payload) => {
                    let parsed = match serde_json::from_str::<StreamChunk>(&payload) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            // Malformed event lines are skipped, not fatal.
                            tracing::warn!(error = %e, "Skipping malformed SSE chunk");
                            continue;
                        }
                    };

                    if let Some(error) = parsed.error {
                        let message = error.to_string();
                        let _ = tx
                            .send(AiEvent::Error {
                                code: ExecutionErrorCode::Internal,
                                message: message.clone(),
                            })
                            .await;
                        final_tx.settle(Err(TransportError::Stream(message)));
                        return;
                    }

                    if let Some(delta) = state.absorb(parsed) {
                        if tx.send(AiEvent::TextDelta { text: delta }).await.is_err() {
                            // Consumer dropped the stream; release the
                            // connection and keep the partial content.
                            final_tx.settle(Ok(state.outcome(true)));
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn header_string(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

fn header_f64(headers: &reqwest::header::HeaderMap, name: &str) -> Option<f64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn truncate_body(body: &str) -> String {
    body.chars().take(ERROR_BODY_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash() {
        let client = LlmClient::new("http://localhost:4000/", "sk-master");
        assert_eq!(client.base_url(), "http://localhost:4000");
    }

    #[test]
    fn stream_state_keeps_first_call_id() {
        let mut state = StreamState {
            content: String::new(),
            call_id: None,
            cost_usd: None,
            input_tokens: None,
            output_tokens: None,
            model: None,
            finish_reason: FinishReason::Unknown,
        };

        let first: StreamChunk =
            serde_json::from_str(r#"{"id":"gen-1","choices":[{"delta":{"content":"a"}}]}"#)
                .unwrap();
        let second: StreamChunk =
            serde_json::from_str(r#"{"id":"gen-2","choices":[{"delta":{"content":"b"}}]}"#)
                .unwrap();

        assert_eq!(state.absorb(first).as_deref(), Some("a"));
        assert_eq!(state.absorb(second).as_deref(), Some("b"));
        assert_eq!(state.call_id.as_deref(), Some("gen-1"));
        assert_eq!(state.content, "ab");
    }

    #[test]
    fn resolve_without_call_id_is_hard_error() {
        let state = StreamState {
            content: "partial".into(),
            call_id: None,
            cost_usd: None,
            input_tokens: None,
            output_tokens: None,
            model: None,
            finish_reason: FinishReason::Stop,
        };
        assert!(matches!(
            state.resolve(),
            Err(TransportError::MissingCallId)
        ));
    }

    #[test]
    fn abort_outcome_keeps_partial_without_call_id() {
        let state = StreamState {
            content: "part".into(),
            call_id: None,
            cost_usd: None,
            input_tokens: None,
            output_tokens: None,
            model: None,
            finish_reason: FinishReason::Unknown,
        };
        let outcome = state.outcome(true);
        assert!(outcome.aborted);
        assert_eq!(outcome.content, "part");
        assert_eq!(outcome.finish_reason, FinishReason::Aborted);
    }
}
