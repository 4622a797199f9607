use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use axum::routing::{get, post};
use bytes::Bytes;
use opendum_core::accounts::AccountOnboarding;
use opendum_core::auth::{self, CallerIdentity};
use opendum_core::engine::{Dialect, ProxyEngine, ProxyReply, ReplyBody};
use opendum_protocol::error::{AnthropicErrorEnvelope, ErrorEnvelope, ErrorKind};
use opendum_storage::AccountStore;
use tokio_stream::wrappers::ReceiverStream;

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SSE_HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProxyEngine>,
    pub store: Arc<dyn AccountStore>,
    pub onboarding: Arc<AccountOnboarding>,
}

pub fn proxy_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/responses", post(responses))
        .route("/v1/models", get(list_models))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let caller = match authenticate_caller(&state, &headers, Dialect::Chat).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    into_response(state.engine.handle_chat(caller, body).await)
}

async fn anthropic_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let caller = match authenticate_caller(&state, &headers, Dialect::Anthropic).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    into_response(state.engine.handle_anthropic(caller, body).await)
}

async fn responses(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let caller = match authenticate_caller(&state, &headers, Dialect::Responses).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    into_response(state.engine.handle_responses(caller, body).await)
}

async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let caller = match authenticate_caller(&state, &headers, Dialect::Chat).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    let data: Vec<serde_json::Value> = state
        .engine
        .models()
        .entries()
        .iter()
        .filter(|entry| caller.access.permits(entry.id))
        .map(|entry| {
            serde_json::json!({
                "id": entry.id,
                "object": "model",
                "owned_by": entry.providers.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
            })
        })
        .collect();
    json_response(
        StatusCode::OK,
        serde_json::json!({ "object": "list", "data": data }),
    )
}

pub(crate) async fn authenticate_caller(
    state: &AppState,
    headers: &HeaderMap,
    dialect: Dialect,
) -> Result<CallerIdentity, Response> {
    let Some(key) = auth::extract_api_key(headers) else {
        return Err(auth_error(dialect, "Missing API key."));
    };
    match auth::authenticate(&state.store, &key).await {
        Some(caller) => Ok(caller),
        None => Err(auth_error(dialect, "Invalid API key.")),
    }
}

fn auth_error(dialect: Dialect, message: &str) -> Response {
    let body = match dialect {
        Dialect::Anthropic => serde_json::to_vec(&AnthropicErrorEnvelope::new(
            ErrorKind::AuthenticationError,
            message,
        ))
        .unwrap_or_default(),
        _ => serde_json::to_vec(&ErrorEnvelope::new(
            ErrorKind::AuthenticationError,
            message,
        ))
        .unwrap_or_default(),
    };
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}

pub(crate) fn json_response(status: StatusCode, value: serde_json::Value) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&value).unwrap_or_default()))
        .unwrap_or_default()
}

pub(crate) fn into_response(reply: ProxyReply) -> Response {
    match reply.body {
        ReplyBody::Json(bytes) => Response::builder()
            .status(reply.status)
            .header(header::CONTENT_TYPE, reply.content_type)
            .body(Body::from(bytes))
            .unwrap_or_default(),
        ReplyBody::Stream(rx) => sse_response(rx),
    }
}

/// Streamed replies get keep-alive comment frames whenever the engine is
/// quiet for a while, so intermediaries do not cut the connection.
fn sse_response(mut rx: tokio::sync::mpsc::Receiver<Bytes>) -> Response {
    let (out_tx, out_rx) = tokio::sync::mpsc::channel::<Result<Bytes, Infallible>>(32);
    tokio::spawn(async move {
        loop {
            match tokio::time::timeout(SSE_HEARTBEAT_INTERVAL, rx.recv()).await {
                Ok(Some(frame)) => {
                    if out_tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    if out_tx
                        .send(Ok(Bytes::from_static(SSE_HEARTBEAT_FRAME)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(ReceiverStream::new(out_rx)))
        .unwrap_or_default()
}
