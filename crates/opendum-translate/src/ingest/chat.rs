use opendum_protocol::canonical::{
    CanonicalMessage, CanonicalRequest, CanonicalRole, CanonicalTool, CanonicalToolCall,
    CanonicalToolChoice,
};
use opendum_protocol::chat::request::{ChatCompletionRequest, ChatRole};
use serde_json::Value as JsonValue;

use crate::TranslateError;

pub fn chat_to_canonical(req: ChatCompletionRequest) -> Result<CanonicalRequest, TranslateError> {
    if req.messages.is_empty() {
        return Err(TranslateError::MissingField("messages"));
    }

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<CanonicalMessage> = Vec::new();

    for message in req.messages {
        let text = message
            .content
            .as_ref()
            .map(|content| content.joined_text())
            .unwrap_or_default();
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            ChatRole::User => {
                messages.push(CanonicalMessage::text(CanonicalRole::User, text));
            }
            ChatRole::Assistant => {
                let tool_calls = message
                    .tool_calls
                    .unwrap_or_default()
                    .into_iter()
                    .map(|call| CanonicalToolCall {
                        id: call.id,
                        name: call.function.name,
                        arguments: call.function.arguments,
                    })
                    .collect();
                messages.push(CanonicalMessage {
                    role: CanonicalRole::Assistant,
                    content: text,
                    tool_calls,
                    tool_call_id: None,
                });
            }
            ChatRole::Tool => {
                messages.push(CanonicalMessage {
                    role: CanonicalRole::Tool,
                    content: text,
                    tool_calls: Vec::new(),
                    tool_call_id: message.tool_call_id,
                });
            }
        }
    }

    let tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| CanonicalTool {
            name: tool.function.name,
            description: tool.function.description,
            parameters: tool
                .function
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
        max_tokens: req.max_completion_tokens.or(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop.map(|stop| stop.into_vec()).unwrap_or_default(),
        // The Chat dialect has no opt-in flag; reasoning deltas map onto
        // `reasoning_content` whenever the upstream produces them.
        include_reasoning: true,
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
    let name = value.get("function")?.get("name")?.as_str()?;
    Some(CanonicalToolChoice::Function {
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendum_protocol::chat::request::{ChatMessageContent, ChatRequestMessage};
    use serde_json::json;

    fn user_message(text: &str) -> ChatRequestMessage {
        ChatRequestMessage {
            role: ChatRole::User,
            content: Some(ChatMessageContent::Text(text.to_string())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    fn base_request(messages: Vec<ChatRequestMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "m1".to_string(),
            messages,
            tools: None,
            tool_choice: None,
            max_tokens: None,
            max_completion_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            stream: None,
            stream_options: None,
            user: None,
        }
    }

    #[test]
    fn system_messages_are_hoisted() {
        let mut req = base_request(vec![user_message("hi")]);
        req.messages.insert(
            0,
            ChatRequestMessage {
                role: ChatRole::System,
                content: Some(ChatMessageContent::Text("be brief".to_string())),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            },
        );
        let canonical = chat_to_canonical(req).unwrap();
        assert_eq!(canonical.system.as_deref(), Some("be brief"));
        assert_eq!(canonical.messages.len(), 1);
    }

    #[test]
    fn stream_defaults_to_true() {
        let canonical = chat_to_canonical(base_request(vec![user_message("hi")])).unwrap();
        assert!(canonical.stream);
    }

    #[test]
    fn tool_choice_object_maps_to_function() {
        let mut req = base_request(vec![user_message("hi")]);
        req.tool_choice = Some(json!({"type": "function", "function": {"name": "f"}}));
        let canonical = chat_to_canonical(req).unwrap();
        assert_eq!(
            canonical.tool_choice,
            Some(CanonicalToolChoice::Function {
                name: "f".to_string()
            })
        );
    }

    #[test]
    fn empty_messages_are_rejected() {
        assert!(chat_to_canonical(base_request(Vec::new())).is_err());
    }
}
