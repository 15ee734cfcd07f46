//! Transport integration tests against a mock proxy.

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cogni_core::{AiEvent, ChatMessage, ExecutionErrorCode, FinishReason};
use cogni_llm::{CompletionRequest, LlmClient, SpendScan, TransportError};

fn request() -> CompletionRequest {
    CompletionRequest {
        messages: vec![ChatMessage::user("hi")],
        model: "gpt-test".into(),
        temperature: None,
        max_tokens: None,
        end_user: Some("acct-1".into()),
        metadata: serde_json::json!({"run_id": "r1"}),
    }
}

async fn drain(mut rx: tokio::sync::mpsc::Receiver<AiEvent>) -> Vec<AiEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

// ============================================================================
// Single-shot
// ============================================================================

#[tokio::test]
async fn single_shot_extracts_cost_and_call_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-litellm-call-id", "gen-abc")
                .insert_header("x-litellm-response-cost", "0.002")
                .set_body_json(serde_json::json!({
                    "id": "chatcmpl-1",
                    "model": "gpt-test",
                    "choices": [{
                        "message": {"content": "hello there"},
                        "finish_reason": "stop"
                    }],
                    "usage": {"prompt_tokens": 5, "completion_tokens": 7}
                })),
        )
        .mount(&server)
        .await;

    let client = LlmClient::new(server.uri(), "sk-master");
    let outcome = client.completion(&request()).await.unwrap();

    assert_eq!(outcome.content, "hello there");
    assert_eq!(outcome.call_id.as_deref(), Some("gen-abc"));
    assert_eq!(outcome.cost_usd, Some(0.002));
    assert_eq!(outcome.input_tokens, Some(5));
    assert_eq!(outcome.output_tokens, Some(7));
    assert_eq!(outcome.finish_reason, FinishReason::Stop);
}

#[tokio::test]
async fn single_shot_falls_back_to_body_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "chatcmpl-77",
            "choices": [{"message": {"content": "ok"}, "finish_reason": "stop"}]
        })))
        .mount(&server)
        .await;

    let client = LlmClient::new(server.uri(), "sk-master");
    let outcome = client.completion(&request()).await.unwrap();
    assert_eq!(outcome.call_id.as_deref(), Some("chatcmpl-77"));
}

#[tokio::test]
async fn single_shot_missing_call_id_is_hard_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"content": "ok"}, "finish_reason": "stop"}]
        })))
        .mount(&server)
        .await;

    let client = LlmClient::new(server.uri(), "sk-master");
    let result = client.completion(&request()).await;
    assert!(matches!(result, Err(TransportError::MissingCallId)));
}

#[tokio::test]
async fn upstream_429_classifies_as_rate_limit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let client = LlmClient::new(server.uri(), "sk-master");
    let err = client.completion(&request()).await.unwrap_err();
    assert_eq!(err.to_execution().code(), ExecutionErrorCode::RateLimit);
}

// ============================================================================
// Streaming
// ============================================================================

fn sse_body(lines: &[&str]) -> String {
    let mut body = String::new();
    for line in lines {
        body.push_str("data: ");
        body.push_str(line);
        body.push_str("\n\n");
    }
    body
}

#[tokio::test]
async fn stream_happy_path() {
    let server = MockServer::start().await;
    let body = sse_body(&[
        r#"{"id":"gen-abc","choices":[{"delta":{"content":"hel"}}]}"#,
        r#"{"id":"gen-abc","choices":[{"delta":{"content":"lo"}}]}"#,
        r#"{"id":"gen-abc","choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":5,"completion_tokens":7}}"#,
        "[DONE]",
    ]);
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-litellm-response-cost", "0.002")
                .set_body_raw(body, "text/event-stream"),
        )
        .mount(&server)
        .await;

    let client = LlmClient::new(server.uri(), "sk-master");
    let (rx, final_rx) = client
        .completion_stream(&request(), CancellationToken::new())
        .await
        .unwrap();

    let events = drain(rx).await;
    let deltas: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            AiEvent::TextDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["hel", "lo"]);
    assert!(matches!(events.last(), Some(AiEvent::Done)));

    let outcome = final_rx.wait().await.unwrap().unwrap();
    assert_eq!(outcome.content, "hello");
    assert_eq!(outcome.call_id.as_deref(), Some("gen-abc"));
    assert_eq!(outcome.cost_usd, Some(0.002));
    assert_eq!(outcome.input_tokens, Some(5));
    assert_eq!(outcome.output_tokens, Some(7));
    assert_eq!(outcome.finish_reason, FinishReason::Stop);
    assert!(!outcome.aborted);
}

#[tokio::test]
async fn stream_skips_malformed_lines() {
    let server = MockServer::start().await;
    let body = sse_body(&[
        r#"{"id":"gen-x","choices":[{"delta":{"content":"a"}}]}"#,
        "{not json at all",
        r#"{"id":"gen-x","choices":[{"delta":{"content":"b"}}]}"#,
        "[DONE]",
    ]);
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let client = LlmClient::new(server.uri(), "sk-master");
    let (rx, final_rx) = client
        .completion_stream(&request(), CancellationToken::new())
        .await
        .unwrap();

    let events = drain(rx).await;
    let delta_count = events
        .iter()
        .filter(|e| matches!(e, AiEvent::TextDelta { .. }))
        .count();
    assert_eq!(delta_count, 2);

    let outcome = final_rx.wait().await.unwrap().unwrap();
    assert_eq!(outcome.content, "ab");
}

#[tokio::test]
async fn stream_provider_error_rejects_final() {
    let server = MockServer::start().await;
    let body = sse_body(&[
        r#"{"id":"gen-err","choices":[{"delta":{"content":"a"}}]}"#,
        r#"{"error":{"message":"backend exploded"}}"#,
    ]);
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let client = LlmClient::new(server.uri(), "sk-master");
    let (rx, final_rx) = client
        .completion_stream(&request(), CancellationToken::new())
        .await
        .unwrap();

    let events = drain(rx).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, AiEvent::Error { code: ExecutionErrorCode::Internal, .. })));

    let result = final_rx.wait().await.unwrap();
    assert!(matches!(result, Err(TransportError::Stream(_))));
}

#[tokio::test]
async fn stream_without_call_id_rejects_final() {
    let server = MockServer::start().await;
    let body = sse_body(&[r#"{"choices":[{"delta":{"content":"x"}}]}"#, "[DONE]"]);
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let client = LlmClient::new(server.uri(), "sk-master");
    let (rx, final_rx) = client
        .completion_stream(&request(), CancellationToken::new())
        .await
        .unwrap();

    drain(rx).await;
    let result = final_rx.wait().await.unwrap();
    assert!(matches!(result, Err(TransportError::MissingCallId)));
}

#[tokio::test]
async fn cancelled_before_send_aborts() {
    let client = LlmClient::new("http://127.0.0.1:1", "sk-master");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = client.completion_stream(&request(), cancel).await;
    assert!(matches!(result, Err(TransportError::Aborted)));
}

// ============================================================================
// Spend logs
// ============================================================================

#[tokio::test]
async fn spend_logs_filters_in_memory() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/spend/logs"))
        .and(query_param("end_user", "acct-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"request_id": "gen-new", "startTime": "2026-07-02T00:00:00Z", "spend": 0.01},
            {"request_id": "gen-old", "startTime": "2026-06-01T00:00:00Z", "spend": 0.02}
        ])))
        .mount(&server)
        .await;

    let client = LlmClient::new(server.uri(), "sk-master");
    let from = "2026-07-01T00:00:00Z".parse().unwrap();
    let to = "2026-07-03T00:00:00Z".parse().unwrap();
    let scan = client.spend_logs("acct-1", from, to, 50).await.unwrap();

    match scan {
        SpendScan::Complete(rows) => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].request_id, "gen-new");
        }
        SpendScan::RangeTooLarge => panic!("expected a complete scan"),
    }
}

#[tokio::test]
async fn spend_logs_detects_truncated_range() {
    let server = MockServer::start().await;
    // A full page (limit 2) whose oldest row is still inside the range.
    Mock::given(method("GET"))
        .and(path("/spend/logs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"request_id": "gen-1", "startTime": "2026-07-02T10:00:00Z", "spend": 0.01},
            {"request_id": "gen-2", "startTime": "2026-07-02T09:00:00Z", "spend": 0.01}
        ])))
        .mount(&server)
        .await;

    let client = LlmClient::new(server.uri(), "sk-master");
    let from = "2026-07-01T00:00:00Z".parse().unwrap();
    let to = "2026-07-03T00:00:00Z".parse().unwrap();
    let scan = client.spend_logs("acct-1", from, to, 2).await.unwrap();

    assert!(matches!(scan, SpendScan::RangeTooLarge));
}
