use opendum_protocol::anthropic::request::{
    AnthropicContent, AnthropicMessage, AnthropicRole, AnthropicTool, AnthropicToolChoice,
    ContentBlock, MessagesRequest, SystemPrompt, ThinkingConfig, ToolResultContent,
};
use opendum_protocol::canonical::{CanonicalRequest, CanonicalRole, CanonicalToolChoice};
use serde_json::Value as JsonValue;

use crate::schema::sanitized;

const DEFAULT_MAX_TOKENS: u32 = 8192;
const THINKING_BUDGET_TOKENS: u32 = 1024;

/// Projects the canonical request onto the Anthropic Messages wire form.
/// The upstream call is always streamed; `stream` is set by the adapter.
pub fn canonical_to_anthropic(req: &CanonicalRequest, model: &str) -> MessagesRequest {
    let max_tokens = req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

    let mut messages: Vec<AnthropicMessage> = Vec::new();
    for message in &req.messages {
        match message.role {
            CanonicalRole::System => {
                // Hoisted during ingest; a stray one becomes user text.
                push_text(&mut messages, AnthropicRole::User, &message.content);
            }
            CanonicalRole::User => {
                push_text(&mut messages, AnthropicRole::User, &message.content);
            }
            CanonicalRole::Assistant => {
                let mut blocks: Vec<ContentBlock> = Vec::new();
                if !message.content.is_empty() {
                    blocks.push(ContentBlock::Text {
                        text: message.content.clone(),
                    });
                }
                for call in &message.tool_calls {
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: serde_json::from_str::<JsonValue>(&call.arguments)
                            .unwrap_or_else(|_| serde_json::json!({})),
                    });
                }
                if !blocks.is_empty() {
                    messages.push(AnthropicMessage {
                        role: AnthropicRole::Assistant,
                        content: AnthropicContent::Blocks(blocks),
                    });
                }
            }
            CanonicalRole::Tool => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content: Some(ToolResultContent::Text(message.content.clone())),
                    is_error: None,
                };
                // Consecutive tool results share one user turn.
                let unmerged = match messages.last_mut() {
                    Some(AnthropicMessage {
                        role: AnthropicRole::User,
                        content: AnthropicContent::Blocks(blocks),
                    }) if blocks
                        .iter()
                        .all(|b| matches!(b, ContentBlock::ToolResult { .. })) =>
                    {
                        blocks.push(block);
                        None
                    }
                    _ => Some(block),
                };
                if let Some(block) = unmerged {
                    messages.push(AnthropicMessage {
                        role: AnthropicRole::User,
                        content: AnthropicContent::Blocks(vec![block]),
                    });
                }
            }
        }
    }

    let tools: Vec<AnthropicTool> = req
        .tools
        .iter()
        .map(|tool| AnthropicTool {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: sanitized(tool.parameters.clone()),
        })
        .collect();

    let thinking = if req.include_reasoning && max_tokens > THINKING_BUDGET_TOKENS {
        Some(ThinkingConfig {
            r#type: "enabled".to_string(),
            budget_tokens: Some(THINKING_BUDGET_TOKENS),
        })
    } else {
        None
    };

    MessagesRequest {
        model: model.to_string(),
        messages,
        system: req.system.clone().map(SystemPrompt::Text),
        max_tokens: Some(max_tokens),
        tools: if tools.is_empty() { None } else { Some(tools) },
        tool_choice: req.tool_choice.as_ref().map(map_tool_choice),
        thinking,
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: if req.stop.is_empty() {
            None
        } else {
            Some(req.stop.clone())
        },
        stream: Some(true),
        metadata: None,
    }
}

fn push_text(messages: &mut Vec<AnthropicMessage>, role: AnthropicRole, text: &str) {
    if text.is_empty() {
        return;
    }
    messages.push(AnthropicMessage {
        role,
        content: AnthropicContent::Text(text.to_string()),
    });
}

fn map_tool_choice(choice: &CanonicalToolChoice) -> AnthropicToolChoice {
    match choice {
        CanonicalToolChoice::Auto => AnthropicToolChoice::Auto,
        CanonicalToolChoice::Required => AnthropicToolChoice::Any,
        CanonicalToolChoice::None => AnthropicToolChoice::None,
        CanonicalToolChoice::Function { name } => AnthropicToolChoice::Tool { name: name.clone() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendum_protocol::canonical::{CanonicalMessage, CanonicalTool, CanonicalToolCall};

    #[test]
    fn tool_flow_round_trips_to_blocks() {
        let req = CanonicalRequest {
            model: "claude-x".to_string(),
            messages: vec![
                CanonicalMessage::text(CanonicalRole::User, "q"),
                CanonicalMessage {
                    role: CanonicalRole::Assistant,
                    content: String::new(),
                    tool_calls: vec![CanonicalToolCall {
                        id: "t1".to_string(),
                        name: "f".to_string(),
                        arguments: "{\"a\":1}".to_string(),
                    }],
                    tool_call_id: None,
                },
                CanonicalMessage {
                    role: CanonicalRole::Tool,
                    content: "result".to_string(),
                    tool_calls: Vec::new(),
                    tool_call_id: Some("t1".to_string()),
                },
            ],
            ..CanonicalRequest::default()
        };
        let wire = canonical_to_anthropic(&req, "claude-x");
        assert_eq!(wire.messages.len(), 3);
        match &wire.messages[1].content {
            AnthropicContent::Blocks(blocks) => match &blocks[0] {
                ContentBlock::ToolUse { input, .. } => assert_eq!(input["a"], 1),
                other => panic!("expected tool_use, got {other:?}"),
            },
            other => panic!("expected blocks, got {other:?}"),
        }
        match &wire.messages[2].content {
            AnthropicContent::Blocks(blocks) => {
                assert!(matches!(blocks[0], ContentBlock::ToolResult { .. }));
            }
            other => panic!("expected blocks, got {other:?}"),
        }
    }

    #[test]
    fn schema_is_sanitized_on_the_way_out() {
        let req = CanonicalRequest {
            model: "claude-x".to_string(),
            messages: vec![CanonicalMessage::text(CanonicalRole::User, "q")],
            tools: vec![CanonicalTool {
                name: "f".to_string(),
                description: None,
                parameters: serde_json::json!({
                    "type": "object",
                    "additionalProperties": false
                }),
            }],
            ..CanonicalRequest::default()
        };
        let wire = canonical_to_anthropic(&req, "claude-x");
        let schema = &wire.tools.unwrap()[0].input_schema;
        assert!(schema.get("additionalProperties").is_none());
    }

    #[test]
    fn reasoning_opt_in_enables_thinking() {
        let req = CanonicalRequest {
            model: "claude-x".to_string(),
            messages: vec![CanonicalMessage::text(CanonicalRole::User, "q")],
            include_reasoning: true,
            ..CanonicalRequest::default()
        };
        let wire = canonical_to_anthropic(&req, "claude-x");
        assert!(wire.thinking.unwrap().is_enabled());
    }
}
