use opendum_protocol::canonical::{CanonicalEvent, FinishReason, TokenUsage};
use opendum_translate::aggregate::ChatAggregator;
use opendum_translate::emit::{ChatStreamEncoder, ChatStreamItem};

fn tool_call_stream() -> Vec<CanonicalEvent> {
    vec![
        CanonicalEvent::Text {
            text: "let me ".to_string(),
        },
        CanonicalEvent::Text {
            text: "check".to_string(),
        },
        CanonicalEvent::ToolCallStart {
            id: "call_w1".to_string(),
            name: "weather".to_string(),
        },
        CanonicalEvent::ToolCallArgsDelta {
            id: "call_w1".to_string(),
            fragment: "{\"city\":".to_string(),
        },
        CanonicalEvent::ToolCallArgsDelta {
            id: "call_w1".to_string(),
            fragment: "\"Oslo\"}".to_string(),
        },
        CanonicalEvent::ToolCallEnd {
            id: "call_w1".to_string(),
        },
        CanonicalEvent::Finish {
            reason: FinishReason::ToolUse,
        },
        CanonicalEvent::Usage {
            usage: TokenUsage {
                input_tokens: 11,
                output_tokens: 6,
            },
        },
    ]
}

/// Streaming a tool-calling reply through the Chat encoder and re-reading
/// the chunks preserves concatenated content, the tool id/name, and the
/// joined argument string.
#[test]
fn chat_stream_round_trip_preserves_tool_calls() {
    let mut encoder = ChatStreamEncoder::new("chatcmpl-rt", "m1", 1_700_000_000);
    let mut chunks = Vec::new();
    for event in tool_call_stream() {
        chunks.extend(encoder.encode(event));
    }
    chunks.extend(encoder.finish());

    let mut content = String::new();
    let mut tool_id = None;
    let mut tool_name = None;
    let mut arguments = String::new();
    let mut done_markers = 0;

    for item in &chunks {
        match item {
            ChatStreamItem::Chunk(chunk) => {
                let delta = &chunk.choices[0].delta;
                if let Some(text) = &delta.content {
                    content.push_str(text);
                }
                for call in delta.tool_calls.iter().flatten() {
                    if let Some(id) = &call.id {
                        tool_id = Some(id.clone());
                    }
                    if let Some(function) = &call.function {
                        if let Some(name) = &function.name {
                            tool_name = Some(name.clone());
                        }
                        if let Some(fragment) = &function.arguments {
                            arguments.push_str(fragment);
                        }
                    }
                }
            }
            ChatStreamItem::Done => done_markers += 1,
        }
    }

    assert_eq!(content, "let me check");
    assert_eq!(tool_id.as_deref(), Some("call_w1"));
    assert_eq!(tool_name.as_deref(), Some("weather"));
    assert_eq!(arguments, "{\"city\":\"Oslo\"}");
    assert_eq!(done_markers, 1);
}

/// The aggregated non-stream body agrees with the streamed view.
#[test]
fn chat_aggregate_matches_stream() {
    let mut aggregator = ChatAggregator::new("chatcmpl-rt", "m1", 1_700_000_000);
    for event in tool_call_stream() {
        aggregator.push(event);
    }
    let response = aggregator.finalize();
    let message = &response.choices[0].message;
    assert_eq!(message.content.as_deref(), Some("let me check"));
    let call = &message.tool_calls.as_ref().unwrap()[0];
    assert_eq!(call.id, "call_w1");
    assert_eq!(call.function.arguments, "{\"city\":\"Oslo\"}");
    let usage = response.usage.unwrap();
    assert_eq!((usage.prompt_tokens, usage.completion_tokens), (11, 6));
}

/// Every tool id's start precedes its argument deltas, which precede the
/// terminal marker.
#[test]
fn tool_event_ordering_is_preserved() {
    let mut encoder = ChatStreamEncoder::new("chatcmpl-rt", "m1", 0);
    let mut items = Vec::new();
    for event in tool_call_stream() {
        items.extend(encoder.encode(event));
    }
    items.extend(encoder.finish());

    let mut saw_start = false;
    let mut saw_args = false;
    for item in &items {
        match item {
            ChatStreamItem::Chunk(chunk) => {
                for call in chunk.choices[0].delta.tool_calls.iter().flatten() {
                    if call.id.is_some() {
                        assert!(!saw_args, "start must precede arg deltas");
                        saw_start = true;
                    }
                    if call
                        .function
                        .as_ref()
                        .is_some_and(|f| f.arguments.is_some())
                    {
                        assert!(saw_start, "args before start");
                        saw_args = true;
                    }
                }
            }
            ChatStreamItem::Done => {
                assert!(saw_start && saw_args);
            }
        }
    }
}
