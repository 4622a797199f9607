use opendum_protocol::canonical::{
    CanonicalMessage, CanonicalRequest, CanonicalRole, CanonicalTool, CanonicalToolCall,
    CanonicalToolChoice,
};
use opendum_protocol::responses::request::{InputItem, ResponsesInput, ResponsesRequest};
use serde_json::Value as JsonValue;

use crate::{TranslateError, normalize_call_id};

pub fn responses_to_canonical(req: ResponsesRequest) -> Result<CanonicalRequest, TranslateError> {
    let mut system_parts: Vec<String> = Vec::new();
    if let Some(instructions) = req.instructions.as_deref()
        && !instructions.is_empty()
    {
        system_parts.push(instructions.to_string());
    }

    let mut messages: Vec<CanonicalMessage> = Vec::new();
    match req.input {
        ResponsesInput::Text(text) => {
            messages.push(CanonicalMessage::text(CanonicalRole::User, text));
        }
        ResponsesInput::Items(items) => {
            for item in items {
                match item {
                    InputItem::Message { role, content } => {
                        let text = content.joined_text();
                        match role.as_str() {
                            "system" | "developer" => system_parts.push(text),
                            "assistant" => {
                                messages
                                    .push(CanonicalMessage::text(CanonicalRole::Assistant, text));
                            }
                            _ => messages.push(CanonicalMessage::text(CanonicalRole::User, text)),
                        }
                    }
                    InputItem::FunctionCall {
                        call_id,
                        name,
                        arguments,
                        ..
                    } => {
                        let call = CanonicalToolCall {
                            id: normalize_call_id(&call_id),
                            name,
                            arguments,
                        };
                        // Successive calls accumulate onto the preceding
                        // assistant turn.
                        let unmerged = match messages.last_mut() {
                            Some(last) if last.role == CanonicalRole::Assistant => {
                                last.tool_calls.push(call);
                                None
                            }
                            _ => Some(call),
                        };
                        if let Some(call) = unmerged {
                            messages.push(CanonicalMessage {
                                role: CanonicalRole::Assistant,
                                content: String::new(),
                                tool_calls: vec![call],
                                tool_call_id: None,
                            });
                        }
                    }
                    InputItem::FunctionCallOutput { call_id, output } => {
                        messages.push(CanonicalMessage {
                            role: CanonicalRole::Tool,
                            content: output.joined_text(),
                            tool_calls: Vec::new(),
                            tool_call_id: Some(normalize_call_id(&call_id)),
                        });
                    }
                }
            }
        }
    }

    if messages.is_empty() {
        return Err(TranslateError::MissingField("input"));
    }

    let tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .filter(|tool| tool.r#type == "function")
        .map(|tool| CanonicalTool {
            name: tool.name,
            description: tool.description,
            parameters: tool
                .parameters
                .unwrap_or_else(|| JsonValue::Object(Default::default())),
        })
        .collect();

    Ok(CanonicalRequest {
        model: req.model,
        messages,
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        },
        tools,
        tool_choice: req.tool_choice.as_ref().and_then(parse_tool_choice),
        max_tokens: req.max_output_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stop: Vec::new(),
        include_reasoning: false,
        stream: req.stream.unwrap_or(true),
    })
}

fn parse_tool_choice(value: &JsonValue) -> Option<CanonicalToolChoice> {
    if let Some(mode) = value.as_str() {
        return match mode {
            "auto" => Some(CanonicalToolChoice::Auto),
            "required" => Some(CanonicalToolChoice::Required),
            "none" => Some(CanonicalToolChoice::None),
            _ => None,
        };
    }
    let name = value.get("name")?.as_str()?;
    Some(CanonicalToolChoice::Function {
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendum_protocol::responses::request::InputContent;

    fn base_request(input: ResponsesInput) -> ResponsesRequest {
        ResponsesRequest {
            model: "m1".to_string(),
            input,
            instructions: None,
            tools: None,
            tool_choice: None,
            max_output_tokens: None,
            temperature: None,
            top_p: None,
            stream: None,
            store: None,
            provider_account_id: None,
        }
    }

    #[test]
    fn plain_text_input_becomes_one_user_message() {
        let canonical =
            responses_to_canonical(base_request(ResponsesInput::Text("hi".to_string()))).unwrap();
        assert_eq!(canonical.messages.len(), 1);
        assert_eq!(canonical.messages[0].role, CanonicalRole::User);
    }

    #[test]
    fn developer_messages_join_the_system_prompt() {
        let mut req = base_request(ResponsesInput::Items(vec![
            InputItem::Message {
                role: "developer".to_string(),
                content: InputContent::Text("rules".to_string()),
            },
            InputItem::Message {
                role: "user".to_string(),
                content: InputContent::Text("hi".to_string()),
            },
        ]));
        req.instructions = Some("top".to_string());
        let canonical = responses_to_canonical(req).unwrap();
        assert_eq!(canonical.system.as_deref(), Some("top\n\nrules"));
        assert_eq!(canonical.messages.len(), 1);
    }

    #[test]
    fn function_calls_accumulate_on_the_assistant_turn() {
        let req = base_request(ResponsesInput::Items(vec![
            InputItem::Message {
                role: "assistant".to_string(),
                content: InputContent::Text("let me check".to_string()),
            },
            InputItem::FunctionCall {
                id: None,
                call_id: "fc_1".to_string(),
                name: "a".to_string(),
                arguments: "{}".to_string(),
            },
            InputItem::FunctionCall {
                id: None,
                call_id: "fc-2".to_string(),
                name: "b".to_string(),
                arguments: "{}".to_string(),
            },
            InputItem::FunctionCallOutput {
                call_id: "fc_1".to_string(),
                output: InputContent::Text("ok".to_string()),
            },
        ]));
        let canonical = responses_to_canonical(req).unwrap();
        assert_eq!(canonical.messages.len(), 2);
        let assistant = &canonical.messages[0];
        assert_eq!(assistant.tool_calls.len(), 2);
        assert_eq!(assistant.tool_calls[0].id, "call_1");
        assert_eq!(assistant.tool_calls[1].id, "call_2");
        assert_eq!(canonical.messages[1].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(responses_to_canonical(base_request(ResponsesInput::Items(Vec::new()))).is_err());
    }
}
