use opendum_protocol::canonical::{CanonicalEvent, FinishReason, TokenUsage};
use opendum_protocol::chat::request::{ChatFunctionCall, ChatToolCall};
use opendum_protocol::chat::response::{
    ChatChoice, ChatCompletionResponse, ChatResponseMessage, ChatUsage,
};
use opendum_protocol::chat::stream::ChatFinishReason;

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

/// Collapses a canonical event stream into one Chat Completions body.
#[derive(Debug)]
pub struct ChatAggregator {
    id: String,
    model: String,
    created: i64,
    content: String,
    reasoning: String,
    tool_calls: Vec<ToolCallAccumulator>,
    finish: Option<FinishReason>,
    usage: Option<TokenUsage>,
}

impl ChatAggregator {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            content: String::new(),
            reasoning: String::new(),
            tool_calls: Vec::new(),
            finish: None,
            usage: None,
        }
    }

    pub fn push(&mut self, event: CanonicalEvent) {
        match event {
            CanonicalEvent::Text { text } => self.content.push_str(&text),
            CanonicalEvent::Reasoning { text } => self.reasoning.push_str(&text),
            CanonicalEvent::ToolCallStart { id, name } => {
                self.tool_calls.push(ToolCallAccumulator {
                    id,
                    name,
                    arguments: String::new(),
                });
            }
            CanonicalEvent::ToolCallArgsDelta { id, fragment } => {
                if let Some(call) = self.tool_calls.iter_mut().find(|call| call.id == id) {
                    call.arguments.push_str(&fragment);
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

    pub fn finalize(self) -> ChatCompletionResponse {
        let tool_calls: Vec<ChatToolCall> = self
            .tool_calls
            .into_iter()
            .map(|call| ChatToolCall {
                id: call.id,
                r#type: "function".to_string(),
                function: ChatFunctionCall {
                    name: call.name,
                    arguments: call.arguments,
                },
            })
            .collect();

        let finish_reason = match self.finish.unwrap_or(FinishReason::Stop) {
            FinishReason::Stop => ChatFinishReason::Stop,
            FinishReason::ToolUse => ChatFinishReason::ToolCalls,
            FinishReason::MaxTokens => ChatFinishReason::Length,
            FinishReason::ContentFilter => ChatFinishReason::ContentFilter,
        };

        ChatCompletionResponse {
            id: self.id,
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model,
            choices: vec![ChatChoice {
                index: 0,
                message: ChatResponseMessage {
                    role: "assistant".to_string(),
                    content: if self.content.is_empty() && !tool_calls.is_empty() {
                        None
                    } else {
                        Some(self.content)
                    },
                    reasoning_content: if self.reasoning.is_empty() {
                        None
                    } else {
                        Some(self.reasoning)
                    },
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                },
                finish_reason: Some(finish_reason),
            }],
            usage: self
                .usage
                .map(|usage| ChatUsage::new(usage.input_tokens, usage.output_tokens)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_tool_calls_aggregate() {
        let mut agg = ChatAggregator::new("chatcmpl-1", "m1", 0);
        agg.push(CanonicalEvent::Text {
            text: "hello ".to_string(),
        });
        agg.push(CanonicalEvent::Text {
            text: "world".to_string(),
        });
        agg.push(CanonicalEvent::ToolCallStart {
            id: "call_1".to_string(),
            name: "f".to_string(),
        });
        agg.push(CanonicalEvent::ToolCallArgsDelta {
            id: "call_1".to_string(),
            fragment: "{\"a\":".to_string(),
        });
        agg.push(CanonicalEvent::ToolCallArgsDelta {
            id: "call_1".to_string(),
            fragment: "1}".to_string(),
        });
        agg.push(CanonicalEvent::Finish {
            reason: FinishReason::ToolUse,
        });
        agg.push(CanonicalEvent::Usage {
            usage: TokenUsage {
                input_tokens: 2,
                output_tokens: 9,
            },
        });

        let response = agg.finalize();
        let message = &response.choices[0].message;
        assert_eq!(message.content.as_deref(), Some("hello world"));
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, "{\"a\":1}");
        assert_eq!(
            response.choices[0].finish_reason,
            Some(ChatFinishReason::ToolCalls)
        );
        assert_eq!(response.usage.unwrap().total_tokens, 11);
    }
}
