use opendum_protocol::anthropic::request::{
    AnthropicContent, AnthropicRole, AnthropicToolChoice, ContentBlock, MessagesRequest,
};
use opendum_protocol::canonical::{
    CanonicalMessage, CanonicalRequest, CanonicalRole, CanonicalTool, CanonicalToolCall,
    CanonicalToolChoice,
};

use crate::TranslateError;

pub fn anthropic_to_canonical(req: MessagesRequest) -> Result<CanonicalRequest, TranslateError> {
    if req.messages.is_empty() {
        return Err(TranslateError::MissingField("messages"));
    }

    let include_reasoning = req
        .thinking
        .as_ref()
        .map(|config| config.is_enabled())
        .unwrap_or(false);

    let mut messages: Vec<CanonicalMessage> = Vec::new();
    for message in req.messages {
        let role = match message.role {
            AnthropicRole::User => CanonicalRole::User,
            AnthropicRole::Assistant => CanonicalRole::Assistant,
        };
        match message.content {
            AnthropicContent::Text(text) => {
                messages.push(CanonicalMessage::text(role, text));
            }
            AnthropicContent::Blocks(blocks) => {
                flatten_blocks(role, blocks, &mut messages);
            }
        }
    }

    let tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| CanonicalTool {
            name: tool.name,
            description: tool.description,
            parameters: tool.input_schema,
        })
        .collect();

    Ok(CanonicalRequest {
        model: req.model,
        messages,
        system: req.system.map(|system| system.joined_text()),
        tools,
        tool_choice: req.tool_choice.map(map_tool_choice),
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop_sequences.unwrap_or_default(),
        include_reasoning,
        stream: req.stream.unwrap_or(true),
    })
}

/// Tool results become standalone canonical `tool` messages; thinking
/// blocks are dropped on ingest.
fn flatten_blocks(role: CanonicalRole, blocks: Vec<ContentBlock>, out: &mut Vec<CanonicalMessage>) {
    let mut text = String::new();
    let mut tool_calls: Vec<CanonicalToolCall> = Vec::new();
    let mut tool_results: Vec<CanonicalMessage> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text: part } => text.push_str(&part),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(CanonicalToolCall {
                id,
                name,
                arguments: input.to_string(),
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => tool_results.push(CanonicalMessage {
                role: CanonicalRole::Tool,
                content: content
                    .map(|content| content.joined_text())
                    .unwrap_or_default(),
                tool_calls: Vec::new(),
                tool_call_id: Some(tool_use_id),
            }),
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {}
        }
    }

    out.append(&mut tool_results);
    if !text.is_empty() || !tool_calls.is_empty() {
        out.push(CanonicalMessage {
            role,
            content: text,
            tool_calls,
            tool_call_id: None,
        });
    }
}

fn map_tool_choice(choice: AnthropicToolChoice) -> CanonicalToolChoice {
    match choice {
        AnthropicToolChoice::Auto => CanonicalToolChoice::Auto,
        AnthropicToolChoice::Any => CanonicalToolChoice::Required,
        AnthropicToolChoice::Tool { name } => CanonicalToolChoice::Function { name },
        AnthropicToolChoice::None => CanonicalToolChoice::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendum_protocol::anthropic::request::{AnthropicMessage, ThinkingConfig};
    use serde_json::json;

    fn base_request(messages: Vec<AnthropicMessage>) -> MessagesRequest {
        MessagesRequest {
            model: "m1".to_string(),
            messages,
            system: None,
            max_tokens: Some(1024),
            tools: None,
            tool_choice: None,
            thinking: None,
            temperature: None,
            top_p: None,
            stop_sequences: None,
            stream: None,
            metadata: None,
        }
    }

    #[test]
    fn tool_results_flatten_to_tool_messages() {
        let req = base_request(vec![AnthropicMessage {
            role: AnthropicRole::User,
            content: AnthropicContent::Blocks(vec![
                ContentBlock::ToolResult {
                    tool_use_id: "t1".to_string(),
                    content: Some(opendum_protocol::anthropic::request::ToolResultContent::Text(
                        "42".to_string(),
                    )),
                    is_error: None,
                },
                ContentBlock::Text {
                    text: "next".to_string(),
                },
            ]),
        }]);
        let canonical = anthropic_to_canonical(req).unwrap();
        assert_eq!(canonical.messages.len(), 2);
        assert_eq!(canonical.messages[0].role, CanonicalRole::Tool);
        assert_eq!(canonical.messages[0].tool_call_id.as_deref(), Some("t1"));
        assert_eq!(canonical.messages[1].content, "next");
    }

    #[test]
    fn thinking_blocks_are_dropped_from_requests() {
        let req = base_request(vec![AnthropicMessage {
            role: AnthropicRole::Assistant,
            content: AnthropicContent::Blocks(vec![
                ContentBlock::Thinking {
                    thinking: "hmm".to_string(),
                    signature: None,
                },
                ContentBlock::Text {
                    text: "answer".to_string(),
                },
            ]),
        }]);
        let canonical = anthropic_to_canonical(req).unwrap();
        assert_eq!(canonical.messages.len(), 1);
        assert_eq!(canonical.messages[0].content, "answer");
    }

    #[test]
    fn thinking_flag_enables_reasoning() {
        let mut req = base_request(vec![AnthropicMessage {
            role: AnthropicRole::User,
            content: AnthropicContent::Text("hi".to_string()),
        }]);
        req.thinking = Some(ThinkingConfig {
            r#type: "enabled".to_string(),
            budget_tokens: Some(2048),
        });
        assert!(anthropic_to_canonical(req).unwrap().include_reasoning);
    }

    #[test]
    fn tool_use_blocks_become_tool_calls() {
        let req = base_request(vec![AnthropicMessage {
            role: AnthropicRole::Assistant,
            content: AnthropicContent::Blocks(vec![ContentBlock::ToolUse {
                id: "t9".to_string(),
                name: "lookup".to_string(),
                input: json!({"q": "x"}),
            }]),
        }]);
        let canonical = anthropic_to_canonical(req).unwrap();
        let call = &canonical.messages[0].tool_calls[0];
        assert_eq!(call.name, "lookup");
        assert_eq!(call.arguments, r#"{"q":"x"}"#);
    }
}
