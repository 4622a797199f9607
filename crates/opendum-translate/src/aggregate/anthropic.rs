use opendum_protocol::anthropic::response::{
    AnthropicUsage, MessagesResponse, ResponseContentBlock, StopReason,
};
use opendum_protocol::canonical::{CanonicalEvent, FinishReason, TokenUsage};
use serde_json::Value as JsonValue;

#[derive(Debug)]
struct ToolUseAccumulator {
    id: String,
    name: String,
    arguments: String,
}

/// Collapses a canonical event stream into one Messages body.
#[derive(Debug)]
pub struct AnthropicAggregator {
    message_id: String,
    model: String,
    include_reasoning: bool,
    text: String,
    thinking: String,
    tool_uses: Vec<ToolUseAccumulator>,
    finish: Option<FinishReason>,
    usage: Option<TokenUsage>,
}

impl AnthropicAggregator {
    pub fn new(
        message_id: impl Into<String>,
        model: impl Into<String>,
        include_reasoning: bool,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            include_reasoning,
            text: String::new(),
            thinking: String::new(),
            tool_uses: Vec::new(),
            finish: None,
            usage: None,
        }
    }

    pub fn push(&mut self, event: CanonicalEvent) {
        match event {
            CanonicalEvent::Text { text } => self.text.push_str(&text),
            CanonicalEvent::Reasoning { text } => {
                if self.include_reasoning {
                    self.thinking.push_str(&text);
                }
            }
            CanonicalEvent::ToolCallStart { id, name } => {
                self.tool_uses.push(ToolUseAccumulator {
                    id,
                    name,
                    arguments: String::new(),
                });
            }
            CanonicalEvent::ToolCallArgsDelta { id, fragment } => {
                if let Some(tool) = self.tool_uses.iter_mut().find(|tool| tool.id == id) {
                    tool.arguments.push_str(&fragment);
                }
            }
            CanonicalEvent::ToolCallEnd { .. } => {}
            CanonicalEvent::Finish { reason } => self.finish = Some(reason),
            CanonicalEvent::Usage { usage } => self.usage = Some(usage),
        }
    }

    pub fn observed_usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    pub fn finalize(self) -> MessagesResponse {
        let mut content = Vec::new();
        if !self.thinking.is_empty() {
            content.push(ResponseContentBlock::Thinking {
                thinking: self.thinking,
                signature: None,
            });
        }
        if !self.text.is_empty() {
            content.push(ResponseContentBlock::Text { text: self.text });
        }
        for tool in self.tool_uses {
            // The block carries a JSON object; unparseable accumulations
            // degrade to an empty object.
            let input = serde_json::from_str::<JsonValue>(&tool.arguments)
                .unwrap_or_else(|_| serde_json::json!({}));
            content.push(ResponseContentBlock::ToolUse {
                id: tool.id,
                name: tool.name,
                input,
            });
        }

        let stop_reason = match self.finish.unwrap_or(FinishReason::Stop) {
            FinishReason::Stop => StopReason::EndTurn,
            FinishReason::ToolUse => StopReason::ToolUse,
            FinishReason::MaxTokens => StopReason::MaxTokens,
            FinishReason::ContentFilter => StopReason::Refusal,
        };
        let usage = self.usage.unwrap_or_default();

        MessagesResponse {
            id: self.message_id,
            r#type: "message".to_string(),
            role: "assistant".to_string(),
            model: self.model,
            content,
            stop_reason: Some(stop_reason),
            stop_sequence: None,
            usage: AnthropicUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_assemble_in_order_with_parsed_tool_input() {
        let mut agg = AnthropicAggregator::new("msg_1", "m1", true);
        agg.push(CanonicalEvent::Reasoning {
            text: "think".to_string(),
        });
        agg.push(CanonicalEvent::Text {
            text: "ok".to_string(),
        });
        agg.push(CanonicalEvent::ToolCallStart {
            id: "t1".to_string(),
            name: "f".to_string(),
        });
        agg.push(CanonicalEvent::ToolCallArgsDelta {
            id: "t1".to_string(),
            fragment: "{\"a\":1}".to_string(),
        });
        agg.push(CanonicalEvent::Finish {
            reason: FinishReason::ToolUse,
        });

        let response = agg.finalize();
        assert_eq!(response.content.len(), 3);
        assert!(matches!(
            response.content[0],
            ResponseContentBlock::Thinking { .. }
        ));
        match &response.content[2] {
            ResponseContentBlock::ToolUse { input, .. } => {
                assert_eq!(input["a"], 1);
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn reasoning_is_withheld_without_opt_in() {
        let mut agg = AnthropicAggregator::new("msg_1", "m1", false);
        agg.push(CanonicalEvent::Reasoning {
            text: "secret".to_string(),
        });
        agg.push(CanonicalEvent::Text {
            text: "visible".to_string(),
        });
        let response = agg.finalize();
        assert_eq!(response.content.len(), 1);
    }
}
