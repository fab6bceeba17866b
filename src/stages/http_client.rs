//! Outbound HTTP client stage.
//!
//! Terminal stage of every backend chain: resolves the upstream URL,
//! posts the request body, and classifies the response by content type.
//! `text/event-stream` responses switch to SSE mode, where a producer
//! task feeds parsed chunks into a bounded channel until EOF, error, or
//! cancellation; dropping the byte stream on exit releases the upstream
//! connection.

use crate::core::body::{Body, BodyParser, JsonParser};
use crate::core::sse::SseParser;
use crate::core::stage::Stage;
use crate::core::{ApiFormat, Chunk, ChunkStream, Request, Response, StageResult};
use crate::error::ProxyError;
use crate::schemas::chat::{ChatCompletionChunk, ChatCompletionResponse};
use crate::schemas::messages::{MessagesResponse, MessagesStreamEvent};
use async_trait::async_trait;
use axum::http::{header, StatusCode};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Environment fallback consulted when a backend has no API key.
pub const API_KEY_ENV: &str = "OCTOLLM_API_KEY";

pub const DEFAULT_PATH_CHAT: &str = "/v1/chat/completions";
pub const DEFAULT_PATH_MESSAGES: &str = "/v1/messages";

pub type UrlResolver = Arc<dyn Fn(&Request) -> Result<String, ProxyError> + Send + Sync>;
pub type RequestMutator =
    Arc<dyn Fn(&Request, reqwest::RequestBuilder) -> reqwest::RequestBuilder + Send + Sync>;
pub type ParserFactory = Arc<dyn Fn(&Request) -> Arc<dyn BodyParser> + Send + Sync>;

pub struct HttpClientStage {
    client: reqwest::Client,
    resolve_url: UrlResolver,
    mutate_request: Option<RequestMutator>,
    nonstream_parser: ParserFactory,
    stream_parser: ParserFactory,
}

impl HttpClientStage {
    pub fn new(
        resolve_url: UrlResolver,
        nonstream_parser: ParserFactory,
        stream_parser: ParserFactory,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            resolve_url,
            mutate_request: None,
            nonstream_parser,
            stream_parser,
        }
    }

    /// Use a shared (possibly proxy-configured) client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Hook applied to the outbound request builder, used to inject
    /// vendor API-key headers.
    pub fn with_request_mutator(mut self, mutator: RequestMutator) -> Self {
        self.mutate_request = Some(mutator);
        self
    }
}

#[async_trait]
impl Stage for HttpClientStage {
    async fn process(&self, req: &mut Request) -> StageResult {
        let url = (self.resolve_url)(req)?;
        let body_bytes = req.body.bytes().await?;

        let mut builder = self.client.post(&url);
        for (name, value) in req.headers.iter() {
            if name == header::HOST || name == header::CONTENT_LENGTH {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        if let Some(deadline) = req.context().deadline() {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            builder = builder.timeout(remaining);
        }
        if let Some(mutate) = &self.mutate_request {
            builder = mutate(req, builder);
        }
        builder = builder.body(body_bytes);

        let resp = builder.send().await.map_err(ProxyError::from)?;

        let status = resp.status();
        if status != StatusCode::OK {
            let headers = resp.headers().clone();
            let body = resp.bytes().await.map_err(|err| ProxyError::UpstreamTransport(
                format!("read error response body: {err}"),
            ))?;
            return Err(ProxyError::UpstreamResponse {
                status,
                headers,
                body,
            });
        }

        let headers = resp.headers().clone();
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        debug!(%status, content_type, "upstream response received");

        if !is_event_stream(content_type) {
            let stream = resp
                .bytes_stream()
                .map(|item| item.map_err(std::io::Error::other));
            let body = Body::from_stream(Box::pin(stream), Some((self.nonstream_parser)(req)));
            return Ok(Response::buffered(status, headers, body));
        }

        // SSE mode: one producer task per stream.
        let parser = (self.stream_parser)(req);
        let token = req.context().child_token();
        let (tx, chunk_stream) = ChunkStream::channel(token.clone());
        let mut byte_stream = resp.bytes_stream();

        tokio::spawn(async move {
            let mut sse = SseParser::new();
            'read: loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break 'read,
                    next = byte_stream.next() => next,
                };
                let bytes = match next {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(err)) => {
                        warn!(error = %err, "upstream stream read error");
                        break 'read;
                    }
                    None => break 'read,
                };
                for event in sse.push(&bytes) {
                    let body = Body::from_bytes(event.data, Some(parser.clone()));
                    let chunk = Chunk::with_metadata(body, event.metadata);
                    tokio::select! {
                        _ = token.cancelled() => break 'read,
                        sent = tx.send(chunk) => {
                            if sent.is_err() {
                                break 'read;
                            }
                        }
                    }
                }
            }
            // Dropping the byte stream here closes the upstream body.
        });

        Ok(Response::stream(status, headers, chunk_stream))
    }
}

fn is_event_stream(content_type: &str) -> bool {
    match content_type.parse::<mime::Mime>() {
        Ok(m) => m.type_() == mime::TEXT && m.subtype().as_str() == "event-stream",
        Err(_) => content_type
            .to_ascii_lowercase()
            .starts_with("text/event-stream"),
    }
}

/// Endpoint configuration for a concrete backend, assembled by the
/// composer from a resolved backend descriptor.
#[derive(Debug, Clone, Default)]
pub struct EndpointConfig {
    pub base_url: String,
    pub paths: HashMap<ApiFormat, String>,
    pub api_key: String,
    pub anthropic_api_key_as_bearer: bool,
}

/// Build the standard vendor endpoint: per-format URL resolution,
/// API-key header injection, and per-format response parsers.
pub fn general_endpoint(conf: EndpointConfig, client: reqwest::Client) -> HttpClientStage {
    let mut api_key = conf.api_key.clone();
    if api_key.is_empty() {
        api_key = std::env::var(API_KEY_ENV).unwrap_or_default();
    }

    let base_url = conf.base_url.clone();
    let paths = conf.paths.clone();
    let resolve_url: UrlResolver = Arc::new(move |req: &Request| {
        let path = match paths.get(&req.format) {
            Some(path) if !path.is_empty() => path.clone(),
            _ => match req.format {
                ApiFormat::ChatCompletions => DEFAULT_PATH_CHAT.to_string(),
                ApiFormat::Messages => DEFAULT_PATH_MESSAGES.to_string(),
                ApiFormat::Unknown => {
                    return Err(ProxyError::Internal(format!(
                        "no endpoint for format {}",
                        req.format
                    )))
                }
            },
        };
        Ok(format!("{base_url}{path}"))
    });

    let bearer_for_messages = conf.anthropic_api_key_as_bearer;
    let mutate: RequestMutator = Arc::new(move |req: &Request, builder| {
        if api_key.is_empty() {
            return builder;
        }
        if req.format == ApiFormat::Messages && !bearer_for_messages {
            builder.header("x-api-key", api_key.clone())
        } else {
            builder.header(header::AUTHORIZATION, format!("Bearer {api_key}"))
        }
    });

    let nonstream: ParserFactory = Arc::new(|req: &Request| match req.format {
        ApiFormat::Messages => JsonParser::<MessagesResponse>::arc(),
        _ => JsonParser::<ChatCompletionResponse>::arc(),
    });
    let stream: ParserFactory = Arc::new(|req: &Request| match req.format {
        ApiFormat::Messages => JsonParser::<MessagesStreamEvent>::arc(),
        _ => JsonParser::<ChatCompletionChunk>::arc(),
    });

    HttpClientStage::new(resolve_url, nonstream, stream)
        .with_request_mutator(mutate)
        .with_client(client)
}
