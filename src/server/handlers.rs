//! Handler adapter between the HTTP surface and the core pipeline.
//!
//! For each wire format: build a core [`Request`] with the right parser
//! pre-set on the body, run the composed gateway stage, then serialize
//! the [`Response`] — buffered bodies as-is, streams as SSE with chunk
//! metadata rendered into `event:` / `id:` fields and a flush per event.

use crate::core::body::{Body, BodyParser, JsonParser};
use crate::core::stage::Stage;
use crate::core::{ApiFormat, Request, RequestContext, Response, ResponsePayload};
use crate::error::ProxyError;
use crate::schemas::chat::ChatCompletionRequest;
use crate::schemas::messages::MessagesRequest;
use crate::server::auth::AuthInfo;
use crate::server::AppState;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::Json;
use futures_util::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<AppState>,
    request: axum::extract::Request,
) -> AxumResponse {
    handle(
        state,
        request,
        ApiFormat::ChatCompletions,
        JsonParser::<ChatCompletionRequest>::arc(),
    )
    .await
}

/// `POST /v1/messages`
pub async fn messages(
    State(state): State<AppState>,
    request: axum::extract::Request,
) -> AxumResponse {
    handle(
        state,
        request,
        ApiFormat::Messages,
        JsonParser::<MessagesRequest>::arc(),
    )
    .await
}

/// Liveness probe.
pub async fn health_check() -> AxumResponse {
    Json(json!({"status": "ok"})).into_response()
}

async fn handle(
    state: AppState,
    request: axum::extract::Request,
    format: ApiFormat,
    parser: Arc<dyn BodyParser>,
) -> AxumResponse {
    let auth = request
        .extensions()
        .get::<AuthInfo>()
        .cloned()
        .unwrap_or_default();

    let (parts, body) = request.into_parts();
    let query: HashMap<String, String> = parts
        .uri
        .query()
        .map(|raw| {
            url::form_urlencoded::parse(raw.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();

    let stream = body
        .into_data_stream()
        .map(|item| item.map_err(std::io::Error::other));
    let core_body = Body::from_stream(Box::pin(stream), Some(parser));

    let trace = HashMap::from([
        ("org".to_string(), auth.org.clone()),
        ("user".to_string(), auth.user.clone()),
    ]);
    let mut core_req = Request::new(format, core_body)
        .with_headers(parts.headers)
        .with_context(RequestContext::new(trace));
    core_req.method = parts.method;
    core_req.path = parts.uri.path().to_string();
    core_req.query = query;

    let gateway = crate::composer::GatewayStage::new(state.composer.clone(), auth.org, None);
    match gateway.process(&mut core_req).await {
        Ok(resp) => write_response(resp).await,
        Err(err) => error_response(err),
    }
}

async fn write_response(resp: Response) -> AxumResponse {
    match resp.payload {
        ResponsePayload::Buffered(mut body) => {
            let bytes = match body.bytes().await {
                Ok(bytes) => bytes,
                Err(err) => {
                    error!(error = %err, "failed to read response body");
                    return error_response(err);
                }
            };
            let mut out = AxumResponse::new(axum::body::Body::from(bytes));
            *out.status_mut() = resp.status;
            copy_headers(resp.headers, out.headers_mut(), false);
            out
        }
        ResponsePayload::Stream(stream) => {
            let (rx, cancel) = stream.into_parts();
            // Cancelling on drop both stops the producer chain and, after
            // a normal drain, releases the upstream body.
            let guard = cancel.drop_guard();
            let events = ReceiverStream::new(rx).then(move |mut chunk| {
                let _held = &guard;
                async move {
                    let bytes = match chunk.body.bytes().await {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            warn!(error = %err, "failed to read stream chunk, stream ends");
                            return None;
                        }
                    };
                    let mut event =
                        Event::default().data(String::from_utf8_lossy(&bytes).into_owned());
                    if let Some(kind) = chunk.metadata.get("event") {
                        event = event.event(kind);
                    }
                    if let Some(id) = chunk.metadata.get("id") {
                        event = event.id(id);
                    }
                    Some(event)
                }
            });
            let events = events
                .take_while(|event| futures_util::future::ready(event.is_some()))
                .map(|event| Ok::<Event, Infallible>(event.expect("filtered above")));

            let mut out = Sse::new(events).into_response();
            *out.status_mut() = resp.status;
            copy_headers(resp.headers, out.headers_mut(), true);
            out
        }
    }
}

/// Copy upstream headers onto the outgoing response, dropping
/// `Content-Length`, hop-by-hop headers, and `Content-Type` for SSE
/// output (the SSE writer sets its own).
fn copy_headers(from: HeaderMap, to: &mut HeaderMap, sse: bool) {
    for (name, value) in from.iter() {
        if name == header::CONTENT_LENGTH
            || name == header::TRANSFER_ENCODING
            || name == header::CONNECTION
            || name == header::UPGRADE
            || name.as_str() == "keep-alive"
        {
            continue;
        }
        if sse && name == header::CONTENT_TYPE {
            continue;
        }
        to.insert(name.clone(), value.clone());
    }
}

/// The only place an error becomes bytes on the wire.
fn error_response(err: ProxyError) -> AxumResponse {
    match err {
        ProxyError::UpstreamResponse {
            status,
            headers,
            body,
        } => {
            let mut out = AxumResponse::new(axum::body::Body::from(body));
            *out.status_mut() = status;
            copy_headers(headers, out.headers_mut(), false);
            out
        }
        ProxyError::Handler { status, message } => {
            (status, Json(json!({"error": message}))).into_response()
        }
        ProxyError::UpstreamTransport(message) => {
            error!(error = %message, "upstream transport failure");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "upstream unavailable"})),
            )
                .into_response()
        }
        other => {
            error!(error = %other, "request processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal Server Error"})),
            )
                .into_response()
        }
    }
}
