use opendum_protocol::anthropic::request::{AnthropicContent, ContentBlock, MessagesRequest};
use opendum_protocol::anthropic::stream::{MessagesStreamEvent, StreamContentDelta};
use opendum_protocol::chat::request::{ChatCompletionRequest, ChatMessageContent, ChatRole};
use opendum_protocol::chat::stream::{ChatChunkChoice, ChatCompletionChunk, ChatDelta};
use opendum_protocol::responses::request::{InputItem, ResponsesInput, ResponsesRequest};

#[test]
fn chat_request_accepts_string_and_part_content() {
    let body = r#"{
        "model": "m1",
        "messages": [
            { "role": "system", "content": "be brief" },
            { "role": "user", "content": [
                { "type": "text", "text": "first " },
                { "type": "text", "text": "second" }
            ]}
        ]
    }"#;
    let request: ChatCompletionRequest = serde_json::from_str(body).unwrap();
    assert_eq!(request.messages.len(), 2);
    assert_eq!(request.messages[1].role, ChatRole::User);
    let content = request.messages[1].content.as_ref().unwrap();
    assert_eq!(content.joined_text(), "first second");
    assert!(matches!(content, ChatMessageContent::Parts(_)));
}

#[test]
fn chat_request_parses_tool_calls_and_tool_results() {
    let body = r#"{
        "model": "m1",
        "messages": [
            { "role": "assistant", "tool_calls": [
                { "id": "call_1", "type": "function",
                  "function": { "name": "f", "arguments": "{\"a\":1}" } }
            ]},
            { "role": "tool", "tool_call_id": "call_1", "content": "42" }
        ]
    }"#;
    let request: ChatCompletionRequest = serde_json::from_str(body).unwrap();
    let calls = request.messages[0].tool_calls.as_ref().unwrap();
    assert_eq!(calls[0].function.name, "f");
    assert_eq!(
        request.messages[1].tool_call_id.as_deref(),
        Some("call_1")
    );
}

#[test]
fn anthropic_request_parses_mixed_blocks() {
    let body = r#"{
        "model": "claude-x",
        "max_tokens": 512,
        "messages": [
            { "role": "user", "content": [
                { "type": "tool_result", "tool_use_id": "t1", "content": "ok" },
                { "type": "text", "text": "next step" }
            ]},
            { "role": "assistant", "content": [
                { "type": "thinking", "thinking": "hmm" },
                { "type": "tool_use", "id": "t2", "name": "g", "input": { "q": 1 } }
            ]}
        ],
        "thinking": { "type": "enabled", "budget_tokens": 2048 }
    }"#;
    let request: MessagesRequest = serde_json::from_str(body).unwrap();
    assert!(request.thinking.unwrap().is_enabled());
    let AnthropicContent::Blocks(blocks) = &request.messages[0].content else {
        panic!("expected blocks");
    };
    assert!(matches!(blocks[0], ContentBlock::ToolResult { .. }));
    let AnthropicContent::Blocks(blocks) = &request.messages[1].content else {
        panic!("expected blocks");
    };
    assert!(matches!(blocks[1], ContentBlock::ToolUse { .. }));
}

#[test]
fn responses_input_accepts_text_and_item_forms() {
    let text: ResponsesRequest =
        serde_json::from_str(r#"{ "model": "m1", "input": "hello" }"#).unwrap();
    assert!(matches!(text.input, ResponsesInput::Text(_)));

    let items: ResponsesRequest = serde_json::from_str(
        r#"{
            "model": "m1",
            "input": [
                { "type": "message", "role": "user", "content": "hi" },
                { "type": "function_call", "call_id": "fc_1", "name": "f", "arguments": "{}" },
                { "type": "function_call_output", "call_id": "fc_1", "output": "4" }
            ],
            "provider_account_id": "acct-9"
        }"#,
    )
    .unwrap();
    assert_eq!(items.provider_account_id.as_deref(), Some("acct-9"));
    let ResponsesInput::Items(items) = items.input else {
        panic!("expected items");
    };
    assert!(matches!(items[1], InputItem::FunctionCall { .. }));
    assert!(matches!(items[2], InputItem::FunctionCallOutput { .. }));
}

#[test]
fn anthropic_stream_events_round_trip_their_wire_names() {
    let delta = r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"a\""}}"#;
    let event: MessagesStreamEvent = serde_json::from_str(delta).unwrap();
    match &event {
        MessagesStreamEvent::ContentBlockDelta { index, delta } => {
            assert_eq!(*index, 1);
            assert!(matches!(delta, StreamContentDelta::InputJsonDelta { .. }));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(event.event_name(), "content_block_delta");
    let back = serde_json::to_value(&event).unwrap();
    assert_eq!(back["type"], "content_block_delta");
    assert_eq!(back["delta"]["type"], "input_json_delta");
}

#[test]
fn chat_chunk_serialization_omits_absent_fields() {
    let chunk = ChatCompletionChunk {
        id: "chatcmpl-1".to_string(),
        object: "chat.completion.chunk".to_string(),
        created: 0,
        model: "m1".to_string(),
        choices: vec![ChatChunkChoice {
            index: 0,
            delta: ChatDelta {
                content: Some("hi".to_string()),
                ..ChatDelta::default()
            },
            finish_reason: None,
        }],
        usage: None,
    };
    let json = serde_json::to_value(&chunk).unwrap();
    assert_eq!(json["choices"][0]["delta"]["content"], "hi");
    assert!(json["choices"][0]["delta"].get("tool_calls").is_none());
    assert!(json["choices"][0].get("finish_reason").is_none());
    assert!(json.get("usage").is_none());
}
