//! Cross-protocol format conversion.
//!
//! [`MessagesToChatStage`] lets a chat-speaking backend serve
//! messages-format clients: the request is translated down, the
//! response translated back. The streaming direction reassembles the
//! flat chat delta stream into the event-typed messages stream,
//! reconstructing content-block boundaries with a small state machine
//! keyed on the current block type and the chat tool-call index.

use crate::core::body::{Body, JsonParser};
use crate::core::stage::{SharedStage, Stage};
use crate::core::{
    ApiFormat, Chunk, ChunkSender, ChunkStream, Request, Response, ResponsePayload, StageResult,
};
use crate::error::ProxyError;
use crate::schemas::chat::{
    self, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ContentPart,
    ImageUrl, Message, MessageContent, StreamToolCall, Tool, ToolCall, Usage,
};
use crate::schemas::messages::{
    InputJsonDelta, MessagesRequest, MessagesResponse, MessagesStreamEvent, MessagesUsage,
    RequestContentBlock, ResponseContentBlock, StreamEventDelta, TextDelta, ImageSource,
    MessageDeltaBody, ToolResultContent,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Maps chat finish reasons onto messages stop reasons; unknown values
/// pass through.
pub fn map_finish_reason(reason: &str) -> String {
    match reason {
        "stop" => "end_turn".to_string(),
        "length" => "max_tokens".to_string(),
        "tool_calls" => "tool_use".to_string(),
        other => other.to_string(),
    }
}

/// Routes messages-format requests through the converter and everything
/// else straight to the backend.
pub struct FormatRouteStage {
    messages: SharedStage,
    other: SharedStage,
}

impl FormatRouteStage {
    pub fn new(messages: SharedStage, other: SharedStage) -> Self {
        Self { messages, other }
    }
}

#[async_trait]
impl Stage for FormatRouteStage {
    async fn process(&self, req: &mut Request) -> StageResult {
        if req.format == ApiFormat::Messages {
            self.messages.process(req).await
        } else {
            self.other.process(req).await
        }
    }
}

/// Serves messages-format requests over a chat-speaking downstream.
pub struct MessagesToChatStage {
    next: SharedStage,
}

impl MessagesToChatStage {
    pub fn new(next: SharedStage) -> Self {
        Self { next }
    }
}

#[async_trait]
impl Stage for MessagesToChatStage {
    async fn process(&self, req: &mut Request) -> StageResult {
        let src = req.body.parsed_as::<MessagesRequest>().await?;
        let converted = convert_request(src)?;
        req.body = Body::from_parsed(
            Box::new(converted),
            JsonParser::<ChatCompletionRequest>::arc(),
        );
        req.format = ApiFormat::ChatCompletions;

        let resp = self.next.process(req).await?;

        match resp.payload {
            ResponsePayload::Buffered(mut body) => {
                let chat = body.parsed_as::<ChatCompletionResponse>().await?;
                let messages = convert_response(chat);
                let bytes = serde_json::to_vec(&messages)?;
                let new_body =
                    Body::from_bytes(bytes, Some(JsonParser::<MessagesResponse>::arc()));
                Ok(Response::buffered(resp.status, resp.headers, new_body))
            }
            ResponsePayload::Stream(upstream) => {
                let token = req.context().child_token();
                let (tx, out) = ChunkStream::channel(token.clone());
                tokio::spawn(convert_stream(upstream, tx, token));
                Ok(Response::stream(resp.status, resp.headers, out))
            }
        }
    }
}

/// Translate a messages-format request into a chat-format one.
pub fn convert_request(src: &MessagesRequest) -> Result<ChatCompletionRequest, ProxyError> {
    let mut messages = Vec::new();

    if let Some(system) = &src.system {
        for text in system.texts() {
            messages.push(Message::system(text));
        }
    }

    for msg in &src.messages {
        match msg.role.as_str() {
            "user" => {
                let mut parts = Vec::new();
                for block in msg.content.blocks() {
                    match block {
                        RequestContentBlock::Text { text } => {
                            parts.push(ContentPart::Text { text });
                        }
                        RequestContentBlock::Image { source } => {
                            let url = match source {
                                ImageSource::Base64 { media_type, data } => {
                                    format!("data:{media_type};base64,{data}")
                                }
                                ImageSource::Url { url } => url,
                            };
                            parts.push(ContentPart::ImageUrl {
                                image_url: ImageUrl { url },
                            });
                        }
                        RequestContentBlock::ToolResult {
                            tool_use_id,
                            content,
                        } => {
                            messages.push(Message::tool(
                                tool_use_id,
                                tool_result_content(&content)?,
                            ));
                        }
                        RequestContentBlock::ToolUse { .. } => {
                            // tool_use is an assistant-side block; skip.
                        }
                    }
                }
                if !parts.is_empty() {
                    messages.push(Message {
                        role: "user".to_string(),
                        content: Some(MessageContent::Parts(parts)),
                        name: None,
                        tool_calls: None,
                        tool_call_id: None,
                    });
                }
            }
            "assistant" => {
                let mut parts = Vec::new();
                let mut tool_calls = Vec::new();
                for block in msg.content.blocks() {
                    match block {
                        RequestContentBlock::Text { text } => {
                            parts.push(ContentPart::Text { text });
                        }
                        RequestContentBlock::ToolUse { id, name, input } => {
                            tool_calls.push(ToolCall {
                                id,
                                tool_type: "function".to_string(),
                                function: chat::FunctionCall {
                                    name,
                                    arguments: serde_json::to_string(&input)?,
                                },
                            });
                        }
                        // Assistant messages carry no images or tool results.
                        _ => {}
                    }
                }
                messages.push(Message {
                    role: "assistant".to_string(),
                    content: if parts.is_empty() {
                        None
                    } else {
                        Some(MessageContent::Parts(parts))
                    },
                    name: None,
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                    tool_call_id: None,
                });
            }
            other => {
                warn!(role = other, "unsupported message role dropped in conversion");
            }
        }
    }

    let tools: Vec<Tool> = src
        .tools
        .iter()
        .flatten()
        .filter_map(|tool| {
            let schema = tool.input_schema.as_ref()?;
            Some(Tool {
                tool_type: "function".to_string(),
                function: chat::FunctionDefinition {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: Some(chat::function_parameters(
                        &schema.schema_type,
                        schema.properties.clone(),
                        schema.required.clone(),
                    )),
                },
            })
        })
        .collect();

    Ok(ChatCompletionRequest {
        messages,
        model: Some(src.model.clone()),
        max_tokens: Some(src.max_tokens),
        temperature: src.temperature,
        top_p: src.top_p,
        stream: src.stream,
        tools: if tools.is_empty() { None } else { Some(tools) },
        ..Default::default()
    })
}

fn tool_result_content(content: &ToolResultContent) -> Result<MessageContent, ProxyError> {
    let blocks = match content {
        ToolResultContent::Text(text) => {
            return Ok(MessageContent::Parts(vec![ContentPart::Text {
                text: text.clone(),
            }]))
        }
        ToolResultContent::Blocks(blocks) => blocks,
    };
    let mut parts = Vec::new();
    for block in blocks {
        match block {
            RequestContentBlock::Text { text } => {
                parts.push(ContentPart::Text { text: text.clone() })
            }
            _ => {
                return Err(ProxyError::Internal(
                    "tool result content is not text".to_string(),
                ))
            }
        }
    }
    Ok(MessageContent::Parts(parts))
}

/// Translate a buffered chat response into a messages response.
pub fn convert_response(src: &ChatCompletionResponse) -> MessagesResponse {
    let usage = src.usage.clone().unwrap_or_default();
    let mut out = MessagesResponse {
        id: src.id.clone(),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content: Vec::new(),
        model: src.model.clone(),
        stop_reason: None,
        stop_sequence: None,
        usage: Some(MessagesUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }),
    };

    if let Some(choice) = src.choices.first() {
        if let Some(reason) = &choice.finish_reason {
            out.stop_reason = Some(map_finish_reason(reason));
        }
        if let Some(content) = &choice.message.content {
            out.content.push(ResponseContentBlock::Text {
                text: content.clone(),
            });
        }
        for call in choice.message.tool_calls.iter().flatten() {
            let input: serde_json::Value = match serde_json::from_str(&call.function.arguments) {
                Ok(input) => input,
                Err(err) => {
                    warn!(
                        arguments = %call.function.arguments,
                        error = %err,
                        "invalid tool call arguments dropped"
                    );
                    continue;
                }
            };
            out.content.push(ResponseContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input,
            });
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockType {
    None,
    Text,
    Tool,
}

/// Streaming state machine: chat deltas in, messages events out.
struct StreamConverter {
    tx: ChunkSender,
    token: CancellationToken,
    started: bool,
    current_block_index: i64,
    current_block_type: BlockType,
    current_tool_call_index: i64,
    pending_finish_reason: Option<String>,
    pending_usage: Option<Usage>,
}

impl StreamConverter {
    fn new(tx: ChunkSender, token: CancellationToken) -> Self {
        Self {
            tx,
            token,
            started: false,
            current_block_index: -1,
            current_block_type: BlockType::None,
            current_tool_call_index: -1,
            pending_finish_reason: None,
            pending_usage: None,
        }
    }

    async fn send(&self, event: MessagesStreamEvent) -> Result<(), ()> {
        let bytes = match serde_json::to_vec(&event) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = %err, "failed to serialize stream event");
                return Err(());
            }
        };
        let body = Body::from_bytes(bytes, Some(JsonParser::<MessagesStreamEvent>::arc()));
        let metadata = HashMap::from([("event".to_string(), event.event_type.clone())]);
        let chunk = Chunk::with_metadata(body, metadata);
        tokio::select! {
            _ = self.token.cancelled() => Err(()),
            sent = self.tx.send(chunk) => sent.map_err(|_| ()),
        }
    }

    async fn on_chunk(&mut self, chunk: &ChatCompletionChunk) -> Result<(), ()> {
        if !self.started {
            self.send(MessagesStreamEvent {
                event_type: "message_start".to_string(),
                message: Some(MessagesResponse {
                    id: chunk.id.clone(),
                    response_type: "message".to_string(),
                    role: "assistant".to_string(),
                    content: Vec::new(),
                    model: chunk.model.clone(),
                    stop_reason: None,
                    stop_sequence: None,
                    // Real numbers arrive with message_delta.
                    usage: Some(MessagesUsage::default()),
                }),
                ..Default::default()
            })
            .await?;
            self.started = true;
        }

        let mut delta_content = None;
        let mut tool_calls: &[StreamToolCall] = &[];
        if let Some(choice) = chunk.choices.first() {
            delta_content = choice.delta.content.clone();
            if let Some(calls) = &choice.delta.tool_calls {
                tool_calls = calls;
            }
            if let Some(reason) = &choice.finish_reason {
                if !reason.is_empty() && self.pending_finish_reason.is_none() {
                    self.pending_finish_reason = Some(reason.clone());
                }
            }
        }
        if let Some(usage) = &chunk.usage {
            self.pending_usage = Some(usage.clone());
        }

        if let Some(text) = delta_content.filter(|text| !text.is_empty()) {
            if self.current_block_type != BlockType::Text {
                self.close_current_block().await?;
                self.current_block_index += 1;
                self.send(MessagesStreamEvent {
                    event_type: "content_block_start".to_string(),
                    index: Some(self.current_block_index),
                    content_block: Some(ResponseContentBlock::Text {
                        text: String::new(),
                    }),
                    ..Default::default()
                })
                .await?;
                self.current_block_type = BlockType::Text;
            }
            self.send(MessagesStreamEvent {
                event_type: "content_block_delta".to_string(),
                index: Some(self.current_block_index),
                delta: Some(StreamEventDelta::Text(TextDelta::new(text))),
                ..Default::default()
            })
            .await?;
        }

        for call in tool_calls {
            let continues_current = self.current_block_type == BlockType::Tool
                && self.current_tool_call_index == call.index;
            if !continues_current {
                self.close_current_block().await?;
                self.current_block_index += 1;
                self.send(MessagesStreamEvent {
                    event_type: "content_block_start".to_string(),
                    index: Some(self.current_block_index),
                    content_block: Some(ResponseContentBlock::ToolUse {
                        id: call.id.clone().unwrap_or_default(),
                        name: call
                            .function
                            .as_ref()
                            .and_then(|f| f.name.clone())
                            .unwrap_or_default(),
                        input: serde_json::json!({}),
                    }),
                    ..Default::default()
                })
                .await?;
                self.current_block_type = BlockType::Tool;
                self.current_tool_call_index = call.index;
            }
            let arguments = call
                .function
                .as_ref()
                .and_then(|f| f.arguments.clone())
                .unwrap_or_default();
            if !arguments.is_empty() {
                self.send(MessagesStreamEvent {
                    event_type: "content_block_delta".to_string(),
                    index: Some(self.current_block_index),
                    delta: Some(StreamEventDelta::InputJson(InputJsonDelta::new(arguments))),
                    ..Default::default()
                })
                .await?;
            }
        }

        Ok(())
    }

    async fn close_current_block(&mut self) -> Result<(), ()> {
        if self.current_block_type == BlockType::None {
            return Ok(());
        }
        self.send(MessagesStreamEvent {
            event_type: "content_block_stop".to_string(),
            index: Some(self.current_block_index),
            ..Default::default()
        })
        .await?;
        self.current_block_type = BlockType::None;
        Ok(())
    }

    /// Emitted on `[DONE]` or natural end of stream, whether or not any
    /// chunk arrived: the client always sees a terminal `message_stop`.
    async fn finish(&mut self) -> Result<(), ()> {
        self.close_current_block().await?;
        if let Some(reason) = self.pending_finish_reason.take() {
            let usage = self.pending_usage.take().map(|usage| MessagesUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            });
            self.send(MessagesStreamEvent {
                event_type: "message_delta".to_string(),
                delta: Some(StreamEventDelta::Message(MessageDeltaBody {
                    stop_reason: Some(map_finish_reason(&reason)),
                    stop_sequence: None,
                })),
                usage,
                ..Default::default()
            })
            .await?;
        }
        self.send(MessagesStreamEvent {
            event_type: "message_stop".to_string(),
            ..Default::default()
        })
        .await
    }
}

async fn convert_stream(mut upstream: ChunkStream, tx: ChunkSender, token: CancellationToken) {
    let mut converter = StreamConverter::new(tx, token.clone());
    loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => break,
            chunk = upstream.recv() => chunk,
        };
        let Some(mut chunk) = chunk else {
            // Natural end of stream without a [DONE] frame.
            let _ = converter.finish().await;
            break;
        };
        match chunk.body.parsed_as::<ChatCompletionChunk>().await {
            Ok(parsed) => {
                let parsed = parsed.clone();
                if converter.on_chunk(&parsed).await.is_err() {
                    break;
                }
            }
            Err(err) if err.is_stream_done() => {
                let _ = converter.finish().await;
                break;
            }
            Err(err) => {
                error!(error = %err, "failed to parse stream chunk, skipped");
                continue;
            }
        }
    }
    upstream.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::chat::{Choice, ResponseMessage};
    use crate::schemas::messages::{MessageContent as MsgContent, MessagesMessage};

    #[test]
    fn request_conversion_copies_scalars_and_system() {
        let src = MessagesRequest {
            model: "claude-x".into(),
            max_tokens: 128,
            system: Some(crate::schemas::messages::SystemPrompt::Text(
                "be brief".into(),
            )),
            temperature: Some(0.5),
            stream: Some(true),
            messages: vec![MessagesMessage {
                role: "user".into(),
                content: MsgContent::Text("Hello, how are you?".into()),
            }],
            ..Default::default()
        };
        let out = convert_request(&src).unwrap();
        assert_eq!(out.model.as_deref(), Some("claude-x"));
        assert_eq!(out.max_tokens, Some(128));
        assert_eq!(out.temperature, Some(0.5));
        assert_eq!(out.stream, Some(true));

        assert_eq!(out.messages[0].role, "system");
        assert_eq!(out.messages[0].combined_text(), "be brief");
        assert_eq!(out.messages[1].role, "user");
        let value = serde_json::to_value(&out.messages[1]).unwrap();
        assert_eq!(
            value["content"],
            serde_json::json!([{"type": "text", "text": "Hello, how are you?"}])
        );
    }

    #[test]
    fn request_conversion_maps_images_and_tool_results() {
        let raw = serde_json::json!({
            "model": "m", "max_tokens": 16,
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}},
                {"type": "image", "source": {"type": "url", "url": "https://img.example/a.png"}},
                {"type": "tool_result", "tool_use_id": "call_9", "content": "42"},
                {"type": "text", "text": "what is it"}
            ]}]
        });
        let src: MessagesRequest = serde_json::from_value(raw).unwrap();
        let out = convert_request(&src).unwrap();

        // Tool result becomes its own tool message, emitted before the
        // accumulated user message.
        assert_eq!(out.messages[0].role, "tool");
        assert_eq!(out.messages[0].tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(out.messages[1].role, "user");
        let value = serde_json::to_value(&out.messages[1]).unwrap();
        assert_eq!(
            value["content"][0]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
        assert_eq!(
            value["content"][1]["image_url"]["url"],
            "https://img.example/a.png"
        );
        assert_eq!(value["content"][2]["text"], "what is it");
    }

    #[test]
    fn request_conversion_maps_assistant_tool_use_and_tools() {
        let raw = serde_json::json!({
            "model": "m", "max_tokens": 16,
            "messages": [{"role": "assistant", "content": [
                {"type": "text", "text": "checking"},
                {"type": "tool_use", "id": "t1", "name": "get_weather",
                 "input": {"city": "Paris"}}
            ]}],
            "tools": [{
                "name": "get_weather",
                "description": "Weather lookup",
                "input_schema": {"type": "object",
                    "properties": {"city": {"type": "string"}},
                    "required": ["city"]}
            }]
        });
        let src: MessagesRequest = serde_json::from_value(raw).unwrap();
        let out = convert_request(&src).unwrap();

        let calls = out.messages[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "t1");
        assert_eq!(calls[0].function.name, "get_weather");
        let args: serde_json::Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args["city"], "Paris");

        let tools = out.tools.as_ref().unwrap();
        assert_eq!(tools[0].function.name, "get_weather");
        let params = tools[0].function.parameters.as_ref().unwrap();
        assert_eq!(params["type"], "object");
        assert_eq!(params["required"][0], "city");
    }

    #[test]
    fn response_conversion_maps_usage_and_finish_reason() {
        let src = ChatCompletionResponse {
            id: "resp-1".into(),
            model: "m".into(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".into(),
                    content: Some("Fine".into()),
                    tool_calls: None,
                },
                finish_reason: Some("length".into()),
            }],
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 8,
                total_tokens: 18,
            }),
            ..Default::default()
        };
        let out = convert_response(&src);
        assert_eq!(out.id, "resp-1");
        assert_eq!(out.response_type, "message");
        assert_eq!(out.stop_reason.as_deref(), Some("max_tokens"));
        let usage = out.usage.unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 8);
        match &out.content[..] {
            [ResponseContentBlock::Text { text }] => assert_eq!(text, "Fine"),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn response_conversion_drops_invalid_tool_arguments() {
        let src = ChatCompletionResponse {
            id: "r".into(),
            model: "m".into(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".into(),
                    content: None,
                    tool_calls: Some(vec![
                        ToolCall {
                            id: "ok".into(),
                            tool_type: "function".into(),
                            function: chat::FunctionCall {
                                name: "f".into(),
                                arguments: r#"{"a":1}"#.into(),
                            },
                        },
                        ToolCall {
                            id: "bad".into(),
                            tool_type: "function".into(),
                            function: chat::FunctionCall {
                                name: "g".into(),
                                arguments: "{not json".into(),
                            },
                        },
                    ]),
                },
                finish_reason: Some("tool_calls".into()),
            }],
            ..Default::default()
        };
        let out = convert_response(&src);
        assert_eq!(out.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(out.content.len(), 1);
        match &out.content[0] {
            ResponseContentBlock::ToolUse { id, input, .. } => {
                assert_eq!(id, "ok");
                assert_eq!(input["a"], 1);
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason("stop"), "end_turn");
        assert_eq!(map_finish_reason("length"), "max_tokens");
        assert_eq!(map_finish_reason("tool_calls"), "tool_use");
        assert_eq!(map_finish_reason("content_filter"), "content_filter");
    }
}
