//! Format-converter behavior over a scripted downstream, covering the
//! request translation and the streaming block state machine.

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use octollm::core::body::{Body, JsonParser};
use octollm::core::stage::Stage;
use octollm::core::{ApiFormat, Chunk, ChunkStream, Request, Response, StageResult};
use octollm::schemas::chat::{
    ChatCompletionChunk, ChatCompletionRequest, StreamChoice, StreamDelta, StreamFunctionCall,
    StreamToolCall, Usage,
};
use octollm::schemas::messages::{MessagesRequest, MessagesStreamEvent, StreamEventDelta};
use octollm::stages::convert::MessagesToChatStage;
use std::sync::{Arc, Mutex};

/// Downstream stage that records the converted chat request and streams
/// back a scripted chunk sequence followed by `[DONE]`.
struct ScriptedChat {
    seen_request: Arc<Mutex<Option<ChatCompletionRequest>>>,
    frames: Vec<ChatCompletionChunk>,
}

#[async_trait]
impl Stage for ScriptedChat {
    async fn process(&self, req: &mut Request) -> StageResult {
        assert_eq!(req.format, ApiFormat::ChatCompletions);
        let chat = req
            .body
            .parsed_as::<ChatCompletionRequest>()
            .await?
            .clone();
        *self.seen_request.lock().unwrap() = Some(chat);

        let token = req.context().child_token();
        let (tx, stream) = ChunkStream::channel(token);
        let frames = self.frames.clone();
        tokio::spawn(async move {
            let parser = JsonParser::<ChatCompletionChunk>::arc;
            for frame in frames {
                let body = Body::from_parsed(Box::new(frame), parser());
                if tx.send(Chunk::new(body)).await.is_err() {
                    return;
                }
            }
            let done = Body::from_bytes(b"[DONE]".as_slice(), Some(parser()));
            let _ = tx.send(Chunk::new(done)).await;
        });
        Ok(Response::stream(StatusCode::OK, HeaderMap::new(), stream))
    }
}

fn text_frame(text: &str) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: "chatcmpl-1".into(),
        model: "gpt-up".into(),
        choices: vec![StreamChoice {
            index: 0,
            delta: StreamDelta {
                content: Some(text.to_string()),
                ..Default::default()
            },
            finish_reason: None,
        }],
        ..Default::default()
    }
}

fn tool_frame(index: i64, id: Option<&str>, name: Option<&str>, args: &str) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: "chatcmpl-1".into(),
        model: "gpt-up".into(),
        choices: vec![StreamChoice {
            index: 0,
            delta: StreamDelta {
                tool_calls: Some(vec![StreamToolCall {
                    index,
                    id: id.map(str::to_string),
                    tool_type: Some("function".into()),
                    function: Some(StreamFunctionCall {
                        name: name.map(str::to_string),
                        arguments: Some(args.to_string()),
                    }),
                }]),
                ..Default::default()
            },
            finish_reason: None,
        }],
        ..Default::default()
    }
}

fn finish_frame(reason: &str, usage: Option<Usage>) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: "chatcmpl-1".into(),
        model: "gpt-up".into(),
        choices: vec![StreamChoice {
            index: 0,
            delta: StreamDelta::default(),
            finish_reason: Some(reason.to_string()),
        }],
        usage,
        ..Default::default()
    }
}

fn messages_request(body: serde_json::Value) -> Request {
    Request::new(
        ApiFormat::Messages,
        Body::from_bytes(
            serde_json::to_vec(&body).unwrap(),
            Some(JsonParser::<MessagesRequest>::arc()),
        ),
    )
}

async fn run_stream(
    frames: Vec<ChatCompletionChunk>,
) -> (Option<ChatCompletionRequest>, Vec<MessagesStreamEvent>) {
    let seen = Arc::new(Mutex::new(None));
    let stage = MessagesToChatStage::new(Arc::new(ScriptedChat {
        seen_request: seen.clone(),
        frames,
    }));

    let mut req = messages_request(serde_json::json!({
        "model": "claude-x",
        "max_tokens": 64,
        "stream": true,
        "messages": [{"role": "user", "content": "Hello, how are you?"}]
    }));
    let resp = stage.process(&mut req).await.unwrap();
    let octollm::core::ResponsePayload::Stream(mut stream) = resp.payload else {
        panic!("expected stream response");
    };

    let mut events = Vec::new();
    while let Some(mut chunk) = stream.recv().await {
        let event = chunk
            .body
            .parsed_as::<MessagesStreamEvent>()
            .await
            .unwrap()
            .clone();
        // The serializer relies on the metadata to write `event:` lines.
        assert_eq!(chunk.metadata.get("event"), Some(&event.event_type));
        events.push(event);
    }
    stream.close();
    let seen_request = seen.lock().unwrap().clone();
    (seen_request, events)
}

fn event_types(events: &[MessagesStreamEvent]) -> Vec<&str> {
    events.iter().map(|e| e.event_type.as_str()).collect()
}

#[tokio::test]
async fn converted_request_reaches_backend_in_chat_shape() {
    let (seen, _) = run_stream(vec![text_frame("hi")]).await;
    let chat = seen.expect("backend saw a request");
    assert_eq!(chat.model.as_deref(), Some("claude-x"));
    assert_eq!(chat.max_tokens, Some(64));
    assert_eq!(chat.stream, Some(true));
    let message = serde_json::to_value(&chat.messages[0]).unwrap();
    assert_eq!(message["role"], "user");
    assert_eq!(
        message["content"],
        serde_json::json!([{"type": "text", "text": "Hello, how are you?"}])
    );
}

#[tokio::test]
async fn text_only_stream_produces_one_text_block() {
    let (_, events) = run_stream(vec![
        text_frame("he"),
        text_frame("llo"),
        finish_frame("stop", Some(Usage {
            prompt_tokens: 3,
            completion_tokens: 2,
            total_tokens: 5,
        })),
    ])
    .await;

    assert_eq!(
        event_types(&events),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    let start = &events[0];
    let message = start.message.as_ref().unwrap();
    assert_eq!(message.id, "chatcmpl-1");
    assert_eq!(message.model, "gpt-up");
    assert_eq!(message.role, "assistant");

    match events[2].delta.as_ref().unwrap() {
        StreamEventDelta::Text(delta) => assert_eq!(delta.text, "he"),
        other => panic!("unexpected delta: {other:?}"),
    }
    match events[3].delta.as_ref().unwrap() {
        StreamEventDelta::Text(delta) => assert_eq!(delta.text, "llo"),
        other => panic!("unexpected delta: {other:?}"),
    }

    let message_delta = &events[5];
    match message_delta.delta.as_ref().unwrap() {
        StreamEventDelta::Message(delta) => {
            assert_eq!(delta.stop_reason.as_deref(), Some("end_turn"));
        }
        other => panic!("unexpected delta: {other:?}"),
    }
    let usage = message_delta.usage.as_ref().unwrap();
    assert_eq!(usage.input_tokens, 3);
    assert_eq!(usage.output_tokens, 2);
}

#[tokio::test]
async fn text_then_tool_call_opens_two_blocks() {
    let (_, events) = run_stream(vec![
        text_frame("I'll check."),
        tool_frame(0, Some("call_1"), Some("get_weather"), ""),
        tool_frame(0, None, None, r#"{"city":"#),
        tool_frame(0, None, None, r#""Paris"}"#),
        finish_frame("tool_calls", Some(Usage {
            prompt_tokens: 7,
            completion_tokens: 9,
            total_tokens: 16,
        })),
    ])
    .await;

    assert_eq!(
        event_types(&events),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    // Text block at index 0, tool block at index 1.
    assert_eq!(events[1].index, Some(0));
    let tool_start = &events[4];
    assert_eq!(tool_start.index, Some(1));
    match tool_start.content_block.as_ref().unwrap() {
        octollm::schemas::messages::ResponseContentBlock::ToolUse { id, name, input } => {
            assert_eq!(id, "call_1");
            assert_eq!(name, "get_weather");
            assert_eq!(input, &serde_json::json!({}));
        }
        other => panic!("unexpected block: {other:?}"),
    }

    // Argument fragments arrive as input_json_delta in order.
    let fragments: Vec<String> = events[5..=6]
        .iter()
        .map(|event| match event.delta.as_ref().unwrap() {
            StreamEventDelta::InputJson(delta) => delta.partial_json.clone(),
            other => panic!("unexpected delta: {other:?}"),
        })
        .collect();
    assert_eq!(fragments.join(""), r#"{"city":"Paris"}"#);

    match events[8].delta.as_ref().unwrap() {
        StreamEventDelta::Message(delta) => {
            assert_eq!(delta.stop_reason.as_deref(), Some("tool_use"));
        }
        other => panic!("unexpected delta: {other:?}"),
    }
}

#[tokio::test]
async fn tool_text_tool_sandwich_produces_three_blocks() {
    let (_, events) = run_stream(vec![
        tool_frame(0, Some("call_0"), Some("first_tool"), r#"{"a":1}"#),
        text_frame("between"),
        tool_frame(1, Some("call_1"), Some("second_tool"), r#"{"b":2}"#),
        finish_frame("tool_calls", None),
    ])
    .await;

    let starts: Vec<(i64, &str)> = events
        .iter()
        .filter(|e| e.event_type == "content_block_start")
        .map(|e| {
            let kind = match e.content_block.as_ref().unwrap() {
                octollm::schemas::messages::ResponseContentBlock::ToolUse { .. } => "tool_use",
                octollm::schemas::messages::ResponseContentBlock::Text { .. } => "text",
            };
            (e.index.unwrap(), kind)
        })
        .collect();
    assert_eq!(starts, vec![(0, "tool_use"), (1, "text"), (2, "tool_use")]);

    // Every opened block is closed, in order.
    let stops: Vec<i64> = events
        .iter()
        .filter(|e| e.event_type == "content_block_stop")
        .map(|e| e.index.unwrap())
        .collect();
    assert_eq!(stops, vec![0, 1, 2]);
    assert_eq!(events.last().unwrap().event_type, "message_stop");
}

#[tokio::test]
async fn same_tool_index_continues_one_block() {
    let (_, events) = run_stream(vec![
        tool_frame(0, Some("call_0"), Some("tool"), r#"{"x""#),
        tool_frame(0, None, None, r#":true}"#),
        finish_frame("tool_calls", None),
    ])
    .await;

    let starts = events
        .iter()
        .filter(|e| e.event_type == "content_block_start")
        .count();
    assert_eq!(starts, 1);
}

#[tokio::test]
async fn empty_stream_still_emits_message_stop() {
    // Upstream that terminates with [DONE] before any content chunk.
    let (_, events) = run_stream(vec![]).await;
    assert_eq!(event_types(&events), vec!["message_stop"]);
}

#[tokio::test]
async fn closing_the_converted_stream_stops_the_upstream_producer() {
    // Upstream that streams forever until its consumer goes away.
    struct Endless;

    #[async_trait]
    impl Stage for Endless {
        async fn process(&self, req: &mut Request) -> StageResult {
            let token = req.context().child_token();
            let (tx, stream) = ChunkStream::channel(token);
            tokio::spawn(async move {
                loop {
                    let body = Body::from_parsed(
                        Box::new(text_frame("x")),
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

    let stage = MessagesToChatStage::new(Arc::new(Endless));
    let mut req = messages_request(serde_json::json!({
        "model": "claude-x", "max_tokens": 8, "stream": true,
        "messages": [{"role": "user", "content": "hi"}]
    }));
    let resp = stage.process(&mut req).await.unwrap();
    let octollm::core::ResponsePayload::Stream(mut stream) = resp.payload else {
        panic!("expected stream");
    };

    // Take a couple of events, then abandon the stream.
    assert!(stream.recv().await.is_some());
    assert!(stream.recv().await.is_some());
    stream.close();

    // The producer chain winds down within bounded delay.
    let drained = tokio::time::timeout(std::time::Duration::from_secs(1), async {
        while stream.recv().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok());
}

#[tokio::test]
async fn stream_without_done_frame_still_finalizes() {
    // Scripted downstream that ends the channel without [DONE].
    struct Truncated;

    #[async_trait]
    impl Stage for Truncated {
        async fn process(&self, req: &mut Request) -> StageResult {
            let token = req.context().child_token();
            let (tx, stream) = ChunkStream::channel(token);
            tokio::spawn(async move {
                let body = Body::from_parsed(
                    Box::new(text_frame("partial")),
                    JsonParser::<ChatCompletionChunk>::arc(),
                );
                let _ = tx.send(Chunk::new(body)).await;
            });
            Ok(Response::stream(StatusCode::OK, HeaderMap::new(), stream))
        }
    }

    let stage = MessagesToChatStage::new(Arc::new(Truncated));
    let mut req = messages_request(serde_json::json!({
        "model": "claude-x", "max_tokens": 8, "stream": true,
        "messages": [{"role": "user", "content": "hi"}]
    }));
    let resp = stage.process(&mut req).await.unwrap();
    let octollm::core::ResponsePayload::Stream(mut stream) = resp.payload else {
        panic!("expected stream");
    };
    let mut types = Vec::new();
    while let Some(mut chunk) = stream.recv().await {
        types.push(
            chunk
                .body
                .parsed_as::<MessagesStreamEvent>()
                .await
                .unwrap()
                .event_type
                .clone(),
        );
    }
    stream.close();
    assert_eq!(
        types,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_stop",
        ]
    );
}
