//! Run execution handlers: the SSE projection of the pipeline.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use cogni_core::{ChatMessage, RunCaller, RunId, RunRequest, TraceId};
use cogni_graph::{GraphCatalogEntry, GraphExecutor};
use cogni_ledger::LedgerStore;

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated user id header, injected by the edge.
const USER_ID_HEADER: &str = "x-cogni-user-id";

/// Optional incoming trace id header.
const TRACE_ID_HEADER: &str = "x-cogni-trace-id";

/// Optional ingress request id header.
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Run request body.
#[derive(Debug, Deserialize)]
pub struct RunBody {
    /// Namespaced graph id.
    pub graph_id: String,

    /// Conversation so far.
    pub messages: Vec<ChatMessage>,

    /// Model override.
    #[serde(default)]
    pub model: Option<String>,

    /// Conversation session.
    #[serde(default)]
    pub session_id: Option<String>,

    /// Tools enabled for this run.
    #[serde(default)]
    pub tool_ids: Option<Vec<String>>,

    /// Ask telemetry to mask rather than scrub content.
    #[serde(default)]
    pub mask_content: bool,
}

pub(crate) fn authenticated_user(headers: &HeaderMap) -> Result<uuid::Uuid, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or(ApiError::Unauthorized)
}

/// `POST /v1/runs` - execute a graph, streaming `AiEvent`s as SSE.
///
/// The recorder is driven in-band: every event is observed for settlement
/// before it is forwarded to the client, and the stream keeps draining for
/// billing if the client disconnects.
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RunBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let user_id = authenticated_user(&headers)?;

    if body.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".into()));
    }

    let trace_id = headers
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| TraceId::parse(v).ok());

    let ingress_request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), ToString::to_string);

    let (account, key) = state.ledger.get_or_create_account(user_id)?;

    let cancel = CancellationToken::new();
    let request = RunRequest {
        run_id: RunId::generate(),
        ingress_request_id,
        graph_id: body.graph_id,
        messages: body.messages,
        model: body.model,
        caller: RunCaller {
            billing_account_id: account.id,
            virtual_key_id: key.id,
            trace_id,
            session_id: body.session_id,
            user_id: Some(user_id.to_string()),
            mask_content: body.mask_content,
        },
        tool_ids: body.tool_ids,
        cancel: cancel.clone(),
    };

    let mut handle = state.executor.run_graph(request).await;
    let recorder = state.recorder.clone();

    // Pre-call failures leave the stream empty with a settled final;
    // project those onto plain HTTP instead of an empty 200 stream.
    let first_event = handle.events.recv().await;
    let Some(first_event) = first_event else {
        let final_value = handle
            .final_rx
            .wait()
            .await
            .ok_or_else(|| ApiError::Internal("run final never settled".into()))?;
        if let Some(code) = final_value.error_code() {
            return Err(ApiError::from_code(code));
        }
        let (_tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(1);
        return Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::new()));
    };

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(64);
    tokio::spawn(async move {
        let mut pending = Some(first_event);
        loop {
            let event = match pending.take() {
                Some(event) => event,
                None => match handle.events.recv().await {
                    Some(event) => event,
                    None => break,
                },
            };

            recorder.observe_event(&event);

            let frame = match serde_json::to_string(&event) {
                Ok(json) => Event::default().data(json),
                Err(e) => {
                    tracing::error!(error = %e, "Event serialization failed");
                    continue;
                }
            };

            if tx.send(Ok(frame)).await.is_err() {
                // Client went away: abort the run but keep consuming so
                // settlement still lands.
                cancel.cancel();
                while let Some(event) = handle.events.recv().await {
                    recorder.observe_event(&event);
                }
                break;
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::new()))
}

/// `GET /v1/graphs` - the flat catalog across providers.
pub async fn list_graphs(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<GraphCatalogEntry>> {
    Json(state.executor.list_graphs())
}
