use std::collections::BTreeMap;

use opendum_protocol::canonical::{CanonicalEvent, FinishReason, TokenUsage};
use opendum_protocol::chat::response::ChatUsage;
use opendum_protocol::chat::stream::{
    ChatChunkChoice, ChatCompletionChunk, ChatDelta, ChatFinishReason, ChatFunctionDelta,
    ChatToolCallDelta,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ChatStreamItem {
    Chunk(ChatCompletionChunk),
    /// The `data: [DONE]` terminal marker.
    Done,
}

/// Re-encodes canonical events as Chat Completions chunks. The final
/// chunk (finish reason + usage) and the `[DONE]` marker are deferred to
/// `finish`, which fires exactly once even when the upstream closes
/// without a terminal event.
#[derive(Debug)]
pub struct ChatStreamEncoder {
    id: String,
    model: String,
    created: i64,
    tool_indices: BTreeMap<String, u32>,
    role_emitted: bool,
    pending_finish: Option<FinishReason>,
    usage: Option<TokenUsage>,
    terminated: bool,
}

impl ChatStreamEncoder {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            tool_indices: BTreeMap::new(),
            role_emitted: false,
            pending_finish: None,
            usage: None,
            terminated: false,
        }
    }

    pub fn encode(&mut self, event: CanonicalEvent) -> Vec<ChatStreamItem> {
        if self.terminated {
            return Vec::new();
        }
        match event {
            CanonicalEvent::Text { text } => {
                if text.is_empty() {
                    return Vec::new();
                }
                self.content_chunk(ChatDelta {
                    content: Some(text),
                    ..ChatDelta::default()
                })
            }
            CanonicalEvent::Reasoning { text } => {
                if text.is_empty() {
                    return Vec::new();
                }
                self.content_chunk(ChatDelta {
                    reasoning_content: Some(text),
                    ..ChatDelta::default()
                })
            }
            CanonicalEvent::ToolCallStart { id, name } => {
                let index = self.tool_index(&id);
                self.content_chunk(ChatDelta {
                    tool_calls: Some(vec![ChatToolCallDelta {
                        index,
                        id: Some(id),
                        r#type: Some("function".to_string()),
                        function: Some(ChatFunctionDelta {
                            name: Some(name),
                            arguments: None,
                        }),
                    }]),
                    ..ChatDelta::default()
                })
            }
            CanonicalEvent::ToolCallArgsDelta { id, fragment } => {
                if fragment.is_empty() {
                    return Vec::new();
                }
                let index = self.tool_index(&id);
                self.content_chunk(ChatDelta {
                    tool_calls: Some(vec![ChatToolCallDelta {
                        index,
                        id: None,
                        r#type: None,
                        function: Some(ChatFunctionDelta {
                            name: None,
                            arguments: Some(fragment),
                        }),
                    }]),
                    ..ChatDelta::default()
                })
            }
            CanonicalEvent::ToolCallEnd { .. } => Vec::new(),
            CanonicalEvent::Finish { reason } => {
                self.pending_finish = Some(reason);
                Vec::new()
            }
            CanonicalEvent::Usage { usage } => {
                self.usage = Some(usage);
                Vec::new()
            }
        }
    }

    /// Emits the final finish/usage chunk and the terminal marker.
    pub fn finish(&mut self) -> Vec<ChatStreamItem> {
        if self.terminated {
            return Vec::new();
        }
        self.terminated = true;
        let finish_reason = map_finish(self.pending_finish.unwrap_or(FinishReason::Stop));
        let usage = self
            .usage
            .map(|usage| ChatUsage::new(usage.input_tokens, usage.output_tokens));
        let chunk = self.chunk(ChatDelta::default(), Some(finish_reason), usage);
        vec![ChatStreamItem::Chunk(chunk), ChatStreamItem::Done]
    }

    pub fn observed_usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    fn tool_index(&mut self, id: &str) -> u32 {
        let next = self.tool_indices.len() as u32;
        *self.tool_indices.entry(id.to_string()).or_insert(next)
    }

    fn content_chunk(&mut self, delta: ChatDelta) -> Vec<ChatStreamItem> {
        let mut items = Vec::with_capacity(2);
        if !self.role_emitted {
            self.role_emitted = true;
            let role_delta = ChatDelta {
                role: Some("assistant".to_string()),
                ..ChatDelta::default()
            };
            items.push(ChatStreamItem::Chunk(self.chunk(role_delta, None, None)));
        }
        items.push(ChatStreamItem::Chunk(self.chunk(delta, None, None)));
        items
    }

    fn chunk(
        &self,
        delta: ChatDelta,
        finish_reason: Option<ChatFinishReason>,
        usage: Option<ChatUsage>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}

fn map_finish(reason: FinishReason) -> ChatFinishReason {
    match reason {
        FinishReason::Stop => ChatFinishReason::Stop,
        FinishReason::ToolUse => ChatFinishReason::ToolCalls,
        FinishReason::MaxTokens => ChatFinishReason::Length,
        FinishReason::ContentFilter => ChatFinishReason::ContentFilter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> ChatStreamEncoder {
        ChatStreamEncoder::new("chatcmpl-1", "m1", 1_700_000_000)
    }

    fn chunks(items: Vec<ChatStreamItem>) -> Vec<ChatCompletionChunk> {
        items
            .into_iter()
            .filter_map(|item| match item {
                ChatStreamItem::Chunk(chunk) => Some(chunk),
                ChatStreamItem::Done => None,
            })
            .collect()
    }

    #[test]
    fn first_content_chunk_is_preceded_by_role() {
        let mut enc = encoder();
        let items = chunks(enc.encode(CanonicalEvent::Text {
            text: "hi".to_string(),
        }));
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(items[1].choices[0].delta.content.as_deref(), Some("hi"));
    }

    #[test]
    fn tool_calls_keep_their_assigned_index() {
        let mut enc = encoder();
        enc.encode(CanonicalEvent::ToolCallStart {
            id: "call_a".to_string(),
            name: "f".to_string(),
        });
        enc.encode(CanonicalEvent::ToolCallStart {
            id: "call_b".to_string(),
            name: "g".to_string(),
        });
        let items = chunks(enc.encode(CanonicalEvent::ToolCallArgsDelta {
            id: "call_a".to_string(),
            fragment: "{".to_string(),
        }));
        let delta = items[0].choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(delta[0].index, 0);
    }

    #[test]
    fn finish_emits_final_chunk_then_done_once() {
        let mut enc = encoder();
        enc.encode(CanonicalEvent::Finish {
            reason: FinishReason::Stop,
        });
        enc.encode(CanonicalEvent::Usage {
            usage: TokenUsage {
                input_tokens: 4,
                output_tokens: 7,
            },
        });
        let items = enc.finish();
        assert_eq!(items.len(), 2);
        match &items[0] {
            ChatStreamItem::Chunk(chunk) => {
                assert_eq!(chunk.choices[0].finish_reason, Some(ChatFinishReason::Stop));
                let usage = chunk.usage.unwrap();
                assert_eq!(usage.prompt_tokens, 4);
                assert_eq!(usage.completion_tokens, 7);
            }
            ChatStreamItem::Done => panic!("expected chunk first"),
        }
        assert_eq!(items[1], ChatStreamItem::Done);
        assert!(enc.finish().is_empty());
    }

    #[test]
    fn finish_defaults_to_stop_on_upstream_eof() {
        let mut enc = encoder();
        enc.encode(CanonicalEvent::Text {
            text: "partial".to_string(),
        });
        let items = enc.finish();
        match &items[0] {
            ChatStreamItem::Chunk(chunk) => {
                assert_eq!(chunk.choices[0].finish_reason, Some(ChatFinishReason::Stop));
            }
            ChatStreamItem::Done => panic!("expected chunk first"),
        }
    }
}
