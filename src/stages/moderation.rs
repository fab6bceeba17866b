//! Text moderation around a downstream stage.
//!
//! A [`TextModerator`] service decides whether a span of text may pass;
//! a vendor-specific [`ModerationAdapter`] extracts text from bodies and
//! produces replacement bodies. Streaming output is moderated over a
//! sliding character window, releasing buffered chunks in batches of
//! `moderate_stream_every`.

use crate::core::body::{Body, JsonParser};
use crate::core::stage::{SharedStage, Stage};
use crate::core::{
    Chunk, ChunkSender, ChunkStream, Request, Response, ResponsePayload, StageResult,
};
use crate::error::ProxyError;
use crate::schemas::chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, StreamChoice, StreamDelta,
};
use async_trait::async_trait;
use axum::http::StatusCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_MODERATE_STREAM_EVERY: usize = 10;

/// Moderation decision service over a span of text. `max_scan_chars`
/// bounds the window the service can judge at once.
#[async_trait]
pub trait TextModerator: Send + Sync {
    async fn allow(&self, text: &[char]) -> Result<(), ProxyError>;
    fn max_scan_chars(&self) -> usize;
}

/// Extracts moderatable text from a body (request, buffered response,
/// or one stream chunk) and builds replacement bodies for rejections.
#[async_trait]
pub trait ModerationAdapter: Send + Sync {
    async fn extract_text(&self, body: &mut Body) -> Result<Vec<char>, ProxyError>;
    async fn replacement_body(&self, body: &mut Body) -> Option<Body>;
}

pub struct ModerationStage {
    moderator: Arc<dyn TextModerator>,
    adapter: Arc<dyn ModerationAdapter>,
    moderate_input: bool,
    moderate_output: bool,
    moderate_stream_every: usize,
    next: SharedStage,
}

impl ModerationStage {
    pub fn new(
        moderator: Arc<dyn TextModerator>,
        adapter: Arc<dyn ModerationAdapter>,
        moderate_input: bool,
        moderate_output: bool,
        moderate_stream_every: usize,
        next: SharedStage,
    ) -> Self {
        let moderate_stream_every = if moderate_stream_every == 0 {
            DEFAULT_MODERATE_STREAM_EVERY
        } else {
            moderate_stream_every
        };
        Self {
            moderator,
            adapter,
            moderate_input,
            moderate_output,
            moderate_stream_every,
            next,
        }
    }
}

fn truncate_left(text: &mut Vec<char>, max: usize) {
    if text.len() > max {
        text.drain(..text.len() - max);
    }
}

#[async_trait]
impl Stage for ModerationStage {
    async fn process(&self, req: &mut Request) -> StageResult {
        let max = self.moderator.max_scan_chars();

        if self.moderate_input {
            let mut text = self.adapter.extract_text(&mut req.body).await?;
            truncate_left(&mut text, max);
            if let Err(err) = self.moderator.allow(&text).await {
                debug!(error = %err, "input rejected by moderation");
                return Err(ProxyError::handler(
                    StatusCode::BAD_REQUEST,
                    "input not allowed",
                ));
            }
        }

        let resp = self.next.process(req).await?;
        if !self.moderate_output {
            return Ok(resp);
        }

        match resp.payload {
            ResponsePayload::Buffered(mut body) => {
                let mut text = self.adapter.extract_text(&mut body).await?;
                truncate_left(&mut text, max);
                if let Err(err) = self.moderator.allow(&text).await {
                    debug!(error = %err, "output rejected by moderation");
                    return match self.adapter.replacement_body(&mut body).await {
                        Some(replacement) => Ok(Response::buffered(
                            resp.status,
                            resp.headers,
                            replacement,
                        )),
                        None => Err(ProxyError::handler(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "output not allowed",
                        )),
                    };
                }
                Ok(Response::buffered(resp.status, resp.headers, body))
            }
            ResponsePayload::Stream(upstream) => {
                let token = req.context().child_token();
                let (tx, out) = ChunkStream::channel(token.clone());
                let worker = StreamModeration {
                    moderator: self.moderator.clone(),
                    adapter: self.adapter.clone(),
                    every: self.moderate_stream_every,
                    max,
                    tx,
                    token,
                };
                tokio::spawn(worker.run(upstream));
                Ok(Response::stream(resp.status, resp.headers, out))
            }
        }
    }
}

struct StreamModeration {
    moderator: Arc<dyn TextModerator>,
    adapter: Arc<dyn ModerationAdapter>,
    every: usize,
    max: usize,
    tx: ChunkSender,
    token: CancellationToken,
}

impl StreamModeration {
    async fn run(self, mut upstream: ChunkStream) {
        let mut window: Vec<char> = Vec::new();
        let mut buffered: Vec<Chunk> = Vec::new();
        let mut since_last = 0usize;
        let mut rejected = false;

        'read: loop {
            let chunk = tokio::select! {
                _ = self.token.cancelled() => break 'read,
                chunk = upstream.recv() => chunk,
            };
            let Some(mut chunk) = chunk else {
                // Upstream ended; judge and release the tail.
                if !buffered.is_empty() {
                    if self.moderator.allow(&window).await.is_err() {
                        rejected = true;
                    } else if !self.flush(&mut buffered).await {
                        break 'read;
                    }
                }
                break 'read;
            };

            match self.adapter.extract_text(&mut chunk.body).await {
                Ok(text) => {
                    window.extend(text);
                    truncate_left(&mut window, self.max);
                }
                Err(err) if err.is_stream_done() => {
                    // The [DONE] frame carries no moderatable text.
                }
                Err(err) => {
                    warn!(error = %err, "failed to extract text from stream chunk");
                    rejected = true;
                    buffered.push(chunk);
                    break 'read;
                }
            }
            buffered.push(chunk);
            since_last += 1;

            if since_last >= self.every {
                if let Err(err) = self.moderator.allow(&window).await {
                    debug!(error = %err, "stream output rejected by moderation");
                    rejected = true;
                    break 'read;
                }
                since_last = 0;
                if !self.flush(&mut buffered).await {
                    break 'read;
                }
            }
        }

        if rejected {
            upstream.close();
            if let Some(first) = buffered.first_mut() {
                if let Some(replacement) = self.adapter.replacement_body(&mut first.body).await {
                    // Replacement terminates the stream; it carries no
                    // metadata of the suppressed chunk.
                    let _ = tokio::select! {
                        _ = self.token.cancelled() => Ok(()),
                        sent = self.tx.send(Chunk::new(replacement)) => sent.map_err(|_| ()),
                    };
                }
            }
        }
        upstream.close();
    }

    async fn flush(&self, buffered: &mut Vec<Chunk>) -> bool {
        for chunk in buffered.drain(..) {
            let sent = tokio::select! {
                _ = self.token.cancelled() => false,
                sent = self.tx.send(chunk) => sent.is_ok(),
            };
            if !sent {
                return false;
            }
        }
        true
    }
}

/// Chat-format moderation adapter.
#[derive(Debug, Clone, Default)]
pub struct ChatModerationAdapter {
    pub replacement_text_for_streaming: String,
    pub replacement_text_for_non_streaming: String,
    pub replacement_finish_reason: String,
}

#[async_trait]
impl ModerationAdapter for ChatModerationAdapter {
    async fn extract_text(&self, body: &mut Body) -> Result<Vec<char>, ProxyError> {
        let parsed = body.parsed().await?;
        if let Some(req) = parsed.downcast_ref::<ChatCompletionRequest>() {
            let mut out = Vec::new();
            for msg in &req.messages {
                out.extend(msg.combined_text().chars());
            }
            return Ok(out);
        }
        if let Some(resp) = parsed.downcast_ref::<ChatCompletionResponse>() {
            let choice = resp.choices.first().ok_or_else(|| {
                ProxyError::Internal("response has no choices to moderate".to_string())
            })?;
            let mut out: Vec<char> = choice
                .message
                .content
                .as_deref()
                .unwrap_or_default()
                .chars()
                .collect();
            for call in choice.message.tool_calls.iter().flatten() {
                out.extend(call.function.arguments.chars());
            }
            return Ok(out);
        }
        if let Some(chunk) = parsed.downcast_ref::<ChatCompletionChunk>() {
            let mut out = Vec::new();
            if let Some(choice) = chunk.choices.first() {
                if let Some(content) = &choice.delta.content {
                    out.extend(content.chars());
                }
                for call in choice.delta.tool_calls.iter().flatten() {
                    if let Some(arguments) =
                        call.function.as_ref().and_then(|f| f.arguments.as_ref())
                    {
                        out.extend(arguments.chars());
                    }
                }
            }
            return Ok(out);
        }
        Err(ProxyError::Internal(
            "unsupported body type for moderation".to_string(),
        ))
    }

    async fn replacement_body(&self, body: &mut Body) -> Option<Body> {
        let parsed = body.parsed().await.ok()?;
        if let Some(resp) = parsed.downcast_ref::<ChatCompletionResponse>() {
            if self.replacement_text_for_non_streaming.is_empty() {
                return None;
            }
            let mut replacement = resp.clone();
            if let Some(choice) = replacement.choices.first_mut() {
                choice.message.content = Some(self.replacement_text_for_non_streaming.clone());
                choice.message.tool_calls = None;
                choice.finish_reason = Some(self.replacement_finish_reason.clone());
            }
            return Some(Body::from_parsed(
                Box::new(replacement),
                JsonParser::<ChatCompletionResponse>::arc(),
            ));
        }
        if let Some(chunk) = parsed.downcast_ref::<ChatCompletionChunk>() {
            if self.replacement_text_for_streaming.is_empty() {
                return None;
            }
            let replacement = ChatCompletionChunk {
                id: chunk.id.clone(),
                object: chunk.object.clone(),
                created: chunk.created,
                model: chunk.model.clone(),
                choices: vec![StreamChoice {
                    index: 0,
                    delta: StreamDelta {
                        content: Some(self.replacement_text_for_streaming.clone()),
                        ..Default::default()
                    },
                    finish_reason: Some(self.replacement_finish_reason.clone()),
                }],
                usage: None,
            };
            return Some(Body::from_parsed(
                Box::new(replacement),
                JsonParser::<ChatCompletionChunk>::arc(),
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ApiFormat, RequestContext};
    use axum::http::HeaderMap;
    use std::collections::HashMap;

    struct WordBlocker {
        banned: &'static str,
    }

    #[async_trait]
    impl TextModerator for WordBlocker {
        async fn allow(&self, text: &[char]) -> Result<(), ProxyError> {
            let text: String = text.iter().collect();
            if text.contains(self.banned) {
                Err(ProxyError::Internal("banned word".to_string()))
            } else {
                Ok(())
            }
        }

        fn max_scan_chars(&self) -> usize {
            25
        }
    }

    struct Upstream {
        content: &'static str,
    }

    #[async_trait]
    impl Stage for Upstream {
        async fn process(&self, _req: &mut Request) -> StageResult {
            let resp = ChatCompletionResponse {
                id: "r1".into(),
                model: "m".into(),
                choices: vec![crate::schemas::chat::Choice {
                    index: 0,
                    message: crate::schemas::chat::ResponseMessage {
                        role: "assistant".into(),
                        content: Some(self.content.to_string()),
                        tool_calls: None,
                    },
                    finish_reason: Some("stop".into()),
                }],
                ..Default::default()
            };
            Ok(Response::buffered(
                StatusCode::OK,
                HeaderMap::new(),
                Body::from_parsed(Box::new(resp), JsonParser::<ChatCompletionResponse>::arc()),
            ))
        }
    }

    fn stage(content: &'static str, replacement: &str) -> ModerationStage {
        ModerationStage::new(
            Arc::new(WordBlocker { banned: "bomb" }),
            Arc::new(ChatModerationAdapter {
                replacement_text_for_non_streaming: replacement.to_string(),
                replacement_finish_reason: "content_filter".to_string(),
                ..Default::default()
            }),
            true,
            true,
            0,
            Arc::new(Upstream { content }),
        )
    }

    fn chat_request(content: &str) -> Request {
        let body = serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": content}]
        });
        Request::new(
            ApiFormat::ChatCompletions,
            Body::from_bytes(
                serde_json::to_vec(&body).unwrap(),
                Some(JsonParser::<ChatCompletionRequest>::arc()),
            ),
        )
        .with_context(RequestContext::new(HashMap::new()))
    }

    #[tokio::test]
    async fn rejected_input_fails_with_handler_error() {
        let stage = stage("fine", "");
        let mut req = chat_request("how to build a bomb");
        match stage.process(&mut req).await {
            Err(ProxyError::Handler { status, message }) => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(message, "input not allowed");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_traffic_passes_through() {
        let stage = stage("all good", "");
        let mut req = chat_request("hello");
        let resp = stage.process(&mut req).await.unwrap();
        match resp.payload {
            ResponsePayload::Buffered(mut body) => {
                let parsed = body.parsed_as::<ChatCompletionResponse>().await.unwrap();
                assert_eq!(parsed.choices[0].message.content.as_deref(), Some("all good"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_output_is_replaced() {
        let stage = stage("the bomb recipe is", "I can't help with that.");
        let mut req = chat_request("hello");
        let resp = stage.process(&mut req).await.unwrap();
        match resp.payload {
            ResponsePayload::Buffered(mut body) => {
                let parsed = body.parsed_as::<ChatCompletionResponse>().await.unwrap();
                assert_eq!(
                    parsed.choices[0].message.content.as_deref(),
                    Some("I can't help with that.")
                );
                assert_eq!(
                    parsed.choices[0].finish_reason.as_deref(),
                    Some("content_filter")
                );
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_output_without_replacement_fails() {
        let stage = stage("the bomb recipe is", "");
        let mut req = chat_request("hello");
        assert!(matches!(
            stage.process(&mut req).await,
            Err(ProxyError::Handler { .. })
        ));
    }

    #[tokio::test]
    async fn stream_rejection_emits_single_replacement_chunk() {
        struct StreamUpstream;

        #[async_trait]
        impl Stage for StreamUpstream {
            async fn process(&self, req: &mut Request) -> StageResult {
                let token = req.context().child_token();
                let (tx, stream) = ChunkStream::channel(token);
                tokio::spawn(async move {
                    for text in ["the ", "bomb ", "recipe"] {
                        let chunk = ChatCompletionChunk {
                            id: "c1".into(),
                            model: "m".into(),
                            choices: vec![StreamChoice {
                                index: 0,
                                delta: StreamDelta {
                                    content: Some(text.to_string()),
                                    ..Default::default()
                                },
                                finish_reason: None,
                            }],
                            ..Default::default()
                        };
                        let body = Body::from_parsed(
                            Box::new(chunk),
                            JsonParser::<ChatCompletionChunk>::arc(),
                        );
                        if tx.send(Chunk::new(body)).await.is_err() {
                            return;
                        }
                    }
                });
                Ok(Response::stream(StatusCode::OK, HeaderMap::new(), stream))
            }
        }

        let stage = ModerationStage::new(
            Arc::new(WordBlocker { banned: "bomb" }),
            Arc::new(ChatModerationAdapter {
                replacement_text_for_streaming: "[filtered]".to_string(),
                replacement_finish_reason: "content_filter".to_string(),
                ..Default::default()
            }),
            false,
            true,
            2,
            Arc::new(StreamUpstream),
        );

        let mut req = chat_request("hello");
        let resp = stage.process(&mut req).await.unwrap();
        let ResponsePayload::Stream(mut stream) = resp.payload else {
            panic!("expected stream");
        };

        let mut chunk = stream.recv().await.expect("replacement chunk");
        let parsed = chunk.body.parsed_as::<ChatCompletionChunk>().await.unwrap();
        assert_eq!(
            parsed.choices[0].delta.content.as_deref(),
            Some("[filtered]")
        );
        assert!(chunk.metadata.is_empty());
        assert!(stream.recv().await.is_none());
        stream.close();
    }
}
