use opendum_protocol::canonical::{CanonicalRequest, CanonicalRole, CanonicalToolChoice};
use opendum_protocol::responses::request::{
    InputContent, InputItem, ResponsesInput, ResponsesRequest, ResponsesTool,
};
use serde_json::Value as JsonValue;

use crate::schema::sanitized;

/// Projects the canonical request onto the Responses-API wire form. The
/// upstream endpoint only streams, so `stream` is pinned true; `store`
/// is pinned false.
pub fn canonical_to_responses(req: &CanonicalRequest, model: &str) -> ResponsesRequest {
    let mut items: Vec<InputItem> = Vec::new();
    for message in &req.messages {
        match message.role {
            CanonicalRole::System => items.push(InputItem::Message {
                role: "developer".to_string(),
                content: InputContent::Text(message.content.clone()),
            }),
            CanonicalRole::User => items.push(InputItem::Message {
                role: "user".to_string(),
                content: InputContent::Text(message.content.clone()),
            }),
            CanonicalRole::Assistant => {
                if !message.content.is_empty() {
                    items.push(InputItem::Message {
                        role: "assistant".to_string(),
                        content: InputContent::Text(message.content.clone()),
                    });
                }
                for call in &message.tool_calls {
                    items.push(InputItem::FunctionCall {
                        id: None,
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    });
                }
            }
            CanonicalRole::Tool => items.push(InputItem::FunctionCallOutput {
                call_id: message.tool_call_id.clone().unwrap_or_default(),
                output: InputContent::Text(message.content.clone()),
            }),
        }
    }

    let tools: Vec<ResponsesTool> = req
        .tools
        .iter()
        .map(|tool| ResponsesTool {
            r#type: "function".to_string(),
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: Some(sanitized(tool.parameters.clone())),
            strict: None,
        })
        .collect();

    ResponsesRequest {
        model: model.to_string(),
        input: ResponsesInput::Items(items),
        instructions: req.system.clone(),
        tools: if tools.is_empty() { None } else { Some(tools) },
        tool_choice: req.tool_choice.as_ref().map(map_tool_choice),
        max_output_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stream: Some(true),
        store: Some(false),
        provider_account_id: None,
    }
}

fn map_tool_choice(choice: &CanonicalToolChoice) -> JsonValue {
    match choice {
        CanonicalToolChoice::Auto => JsonValue::String("auto".to_string()),
        CanonicalToolChoice::Required => JsonValue::String("required".to_string()),
        CanonicalToolChoice::None => JsonValue::String("none".to_string()),
        CanonicalToolChoice::Function { name } => serde_json::json!({
            "type": "function",
            "name": name,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::responses_to_canonical;
    use opendum_protocol::canonical::{CanonicalMessage, CanonicalToolCall};

    #[test]
    fn assistant_tool_calls_become_function_call_items() {
        let req = CanonicalRequest {
            model: "gpt-x".to_string(),
            messages: vec![
                CanonicalMessage::text(CanonicalRole::User, "q"),
                CanonicalMessage {
                    role: CanonicalRole::Assistant,
                    content: String::new(),
                    tool_calls: vec![CanonicalToolCall {
                        id: "call_7".to_string(),
                        name: "f".to_string(),
                        arguments: "{}".to_string(),
                    }],
                    tool_call_id: None,
                },
                CanonicalMessage {
                    role: CanonicalRole::Tool,
                    content: "out".to_string(),
                    tool_calls: Vec::new(),
                    tool_call_id: Some("call_7".to_string()),
                },
            ],
            ..CanonicalRequest::default()
        };
        let wire = canonical_to_responses(&req, "gpt-x");
        let ResponsesInput::Items(items) = &wire.input else {
            panic!("expected items");
        };
        assert!(matches!(items[1], InputItem::FunctionCall { .. }));
        assert!(matches!(items[2], InputItem::FunctionCallOutput { .. }));
        assert_eq!(wire.stream, Some(true));
        assert_eq!(wire.store, Some(false));
    }

    /// Responses input → canonical → Responses input keeps the ordered
    /// message set and tool-call linkage.
    #[test]
    fn responses_round_trip_preserves_linkage() {
        let original = ResponsesRequest {
            model: "gpt-x".to_string(),
            input: ResponsesInput::Items(vec![
                InputItem::Message {
                    role: "user".to_string(),
                    content: InputContent::Text("q".to_string()),
                },
                InputItem::FunctionCall {
                    id: None,
                    call_id: "fc_9".to_string(),
                    name: "f".to_string(),
                    arguments: "{\"x\":2}".to_string(),
                },
                InputItem::FunctionCallOutput {
                    call_id: "fc_9".to_string(),
                    output: InputContent::Text("4".to_string()),
                },
            ]),
            instructions: None,
            tools: None,
            tool_choice: None,
            max_output_tokens: Some(64),
            temperature: None,
            top_p: None,
            stream: Some(false),
            store: None,
            provider_account_id: None,
        };

        let canonical = responses_to_canonical(original).unwrap();
        assert_eq!(canonical.max_tokens, Some(64));
        let wire = canonical_to_responses(&canonical, "gpt-x");
        let ResponsesInput::Items(items) = &wire.input else {
            panic!("expected items");
        };
        assert_eq!(items.len(), 3);
        match (&items[1], &items[2]) {
            (
                InputItem::FunctionCall { call_id, name, .. },
                InputItem::FunctionCallOutput {
                    call_id: output_id, ..
                },
            ) => {
                assert_eq!(call_id, "call_9");
                assert_eq!(output_id, "call_9");
                assert_eq!(name, "f");
            }
            other => panic!("unexpected items: {other:?}"),
        }
    }
}
