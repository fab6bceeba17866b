//! Core request-processing abstractions.
//!
//! A [`Request`] flows through a chain of [`stage::Stage`]s and comes
//! back as a [`Response`] that is either buffered or a cancellable
//! stream of [`Chunk`]s. Bodies are lazy ([`body::Body`]); streams carry
//! backpressure end to end through bounded channels.

pub mod body;
pub mod sse;
pub mod stage;

use crate::error::ProxyError;
use axum::http::{HeaderMap, Method, StatusCode};
use body::Body;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Client-visible wire format of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiFormat {
    /// OpenAI-compatible `chat/completions`.
    ChatCompletions,
    /// Anthropic-compatible `messages`.
    Messages,
    Unknown,
}

impl std::fmt::Display for ApiFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ApiFormat::ChatCompletions => "chat/completions",
            ApiFormat::Messages => "messages",
            ApiFormat::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Per-request context: cancellation, optional deadline, trace metadata.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    trace: Arc<HashMap<String, String>>,
}

impl RequestContext {
    pub fn new(trace: HashMap<String, String>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            trace: Arc::new(trace),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Token for a derived stream; cancelled with the request.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn trace(&self) -> &Arc<HashMap<String, String>> {
        &self.trace
    }

    pub fn trace_value(&self, key: &str) -> Option<&str> {
        self.trace.get(key).map(String::as_str)
    }
}

/// A request travelling down the stage chain. Method, format, path,
/// query and headers are fixed at construction; the body and format tag
/// are mutated by rewriting and converting stages.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub format: ApiFormat,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Body,
    context: RequestContext,
}

impl Request {
    pub fn new(format: ApiFormat, body: Body) -> Self {
        Self {
            method: Method::POST,
            format,
            path: String::new(),
            query: HashMap::new(),
            headers: HeaderMap::new(),
            body,
            context: RequestContext::default(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }
}

/// One SSE event in flight: a body plus a small metadata map
/// (`event`, `id`). Metadata precedes `data:` on the wire.
#[derive(Debug)]
pub struct Chunk {
    pub body: Body,
    pub metadata: HashMap<String, String>,
}

impl Chunk {
    pub fn new(body: Body) -> Self {
        Self {
            body,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(body: Body, metadata: HashMap<String, String>) -> Self {
        Self { body, metadata }
    }
}

/// Capacity of chunk channels. One in-flight chunk, so backpressure
/// propagates from the client writer all the way to the upstream read.
pub const CHUNK_CHANNEL_CAPACITY: usize = 1;

pub type ChunkSender = mpsc::Sender<Chunk>;

/// Lazy, cancellable sequence of chunks. Closing cancels the per-stream
/// token; producer tasks observe it and release the upstream body.
/// Callers must close after draining or abandoning the stream.
#[derive(Debug)]
pub struct ChunkStream {
    rx: mpsc::Receiver<Chunk>,
    cancel: CancellationToken,
}

impl ChunkStream {
    pub fn channel(cancel: CancellationToken) -> (ChunkSender, ChunkStream) {
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        (tx, ChunkStream { rx, cancel })
    }

    pub async fn recv(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Consume into the raw receiver plus the cancel handle, for bridging
    /// into a `ReceiverStream`.
    pub fn into_parts(self) -> (mpsc::Receiver<Chunk>, CancellationToken) {
        (self.rx, self.cancel)
    }
}

/// Stage output: status, headers, and exactly one of a buffered body or
/// a chunk stream.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub payload: ResponsePayload,
}

#[derive(Debug)]
pub enum ResponsePayload {
    Buffered(Body),
    Stream(ChunkStream),
}

impl Response {
    pub fn buffered(status: StatusCode, headers: HeaderMap, body: Body) -> Self {
        Self {
            status,
            headers,
            payload: ResponsePayload::Buffered(body),
        }
    }

    pub fn stream(status: StatusCode, headers: HeaderMap, stream: ChunkStream) -> Self {
        Self {
            status,
            headers,
            payload: ResponsePayload::Stream(stream),
        }
    }
}

/// Convenience alias used across stages.
pub type StageResult = Result<Response, ProxyError>;
