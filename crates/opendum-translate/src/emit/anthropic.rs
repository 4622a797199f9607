use opendum_protocol::anthropic::response::{AnthropicUsage, StopReason};
use opendum_protocol::anthropic::stream::{
    MessagesStreamEvent, StreamContentBlock, StreamContentDelta, StreamMessageDelta,
    StreamMessageStart,
};
use opendum_protocol::canonical::{CanonicalEvent, FinishReason, TokenUsage};

#[derive(Debug, Clone, PartialEq)]
enum OpenBlock {
    Text,
    Thinking,
    Tool { id: String },
}

/// Re-encodes canonical events as Anthropic Messages stream events.
/// Content-block indices are assigned 0,1,2,… with a stop for every
/// start; `message_delta` + `message_stop` fire exactly once from
/// `finish`.
#[derive(Debug)]
pub struct AnthropicStreamEncoder {
    message_id: String,
    model: String,
    include_reasoning: bool,
    started: bool,
    next_index: u32,
    open: Option<OpenBlock>,
    pending_finish: Option<FinishReason>,
    usage: Option<TokenUsage>,
    terminated: bool,
}

impl AnthropicStreamEncoder {
    pub fn new(
        message_id: impl Into<String>,
        model: impl Into<String>,
        include_reasoning: bool,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            include_reasoning,
            started: false,
            next_index: 0,
            open: None,
            pending_finish: None,
            usage: None,
            terminated: false,
        }
    }

    pub fn encode(&mut self, event: CanonicalEvent) -> Vec<MessagesStreamEvent> {
        if self.terminated {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.ensure_started(&mut out);

        match event {
            CanonicalEvent::Text { text } => {
                if text.is_empty() {
                    return out;
                }
                self.ensure_text_block(&mut out);
                out.push(MessagesStreamEvent::ContentBlockDelta {
                    index: self.current_index(),
                    delta: StreamContentDelta::TextDelta { text },
                });
            }
            CanonicalEvent::Reasoning { text } => {
                if !self.include_reasoning || text.is_empty() {
                    return out;
                }
                self.ensure_thinking_block(&mut out);
                out.push(MessagesStreamEvent::ContentBlockDelta {
                    index: self.current_index(),
                    delta: StreamContentDelta::ThinkingDelta { thinking: text },
                });
            }
            CanonicalEvent::ToolCallStart { id, name } => {
                self.close_open_block(&mut out);
                self.open = Some(OpenBlock::Tool { id: id.clone() });
                out.push(MessagesStreamEvent::ContentBlockStart {
                    index: self.next_index,
                    content_block: StreamContentBlock::ToolUse {
                        id,
                        name,
                        input: serde_json::json!({}),
                    },
                });
            }
            CanonicalEvent::ToolCallArgsDelta { id, fragment } => {
                if fragment.is_empty() {
                    return out;
                }
                // Deltas for one call arrive contiguously; reopen the
                // block if the start was not observed.
                if !matches!(&self.open, Some(OpenBlock::Tool { id: open_id }) if *open_id == id) {
                    self.close_open_block(&mut out);
                    self.open = Some(OpenBlock::Tool { id: id.clone() });
                    out.push(MessagesStreamEvent::ContentBlockStart {
                        index: self.next_index,
                        content_block: StreamContentBlock::ToolUse {
                            id,
                            name: String::new(),
                            input: serde_json::json!({}),
                        },
                    });
                }
                out.push(MessagesStreamEvent::ContentBlockDelta {
                    index: self.current_index(),
                    delta: StreamContentDelta::InputJsonDelta {
                        partial_json: fragment,
                    },
                });
            }
            CanonicalEvent::ToolCallEnd { id } => {
                if matches!(&self.open, Some(OpenBlock::Tool { id: open_id }) if *open_id == id) {
                    self.close_open_block(&mut out);
                }
            }
            CanonicalEvent::Finish { reason } => {
                self.pending_finish = Some(reason);
            }
            CanonicalEvent::Usage { usage } => {
                self.usage = Some(usage);
            }
        }
        out
    }

    /// Closes any open block and emits `message_delta` + `message_stop`.
    pub fn finish(&mut self) -> Vec<MessagesStreamEvent> {
        if self.terminated {
            return Vec::new();
        }
        self.terminated = true;
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_open_block(&mut out);
        let usage = self.usage.unwrap_or_default();
        out.push(MessagesStreamEvent::MessageDelta {
            delta: StreamMessageDelta {
                stop_reason: Some(map_stop(self.pending_finish.unwrap_or(FinishReason::Stop))),
                stop_sequence: None,
            },
            usage: Some(AnthropicUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            }),
        });
        out.push(MessagesStreamEvent::MessageStop);
        out
    }

    pub fn observed_usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    fn ensure_started(&mut self, out: &mut Vec<MessagesStreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(MessagesStreamEvent::MessageStart {
            message: StreamMessageStart {
                id: self.message_id.clone(),
                r#type: "message".to_string(),
                role: "assistant".to_string(),
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: AnthropicUsage::default(),
            },
        });
    }

    fn ensure_text_block(&mut self, out: &mut Vec<MessagesStreamEvent>) {
        if matches!(self.open, Some(OpenBlock::Text)) {
            return;
        }
        self.close_open_block(out);
        out.push(MessagesStreamEvent::ContentBlockStart {
            index: self.next_index,
            content_block: StreamContentBlock::Text {
                text: String::new(),
            },
        });
        self.open = Some(OpenBlock::Text);
    }

    fn ensure_thinking_block(&mut self, out: &mut Vec<MessagesStreamEvent>) {
        if matches!(self.open, Some(OpenBlock::Thinking)) {
            return;
        }
        self.close_open_block(out);
        out.push(MessagesStreamEvent::ContentBlockStart {
            index: self.next_index,
            content_block: StreamContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
        });
        self.open = Some(OpenBlock::Thinking);
    }

    fn close_open_block(&mut self, out: &mut Vec<MessagesStreamEvent>) {
        if self.open.take().is_some() {
            out.push(MessagesStreamEvent::ContentBlockStop {
                index: self.next_index,
            });
            self.next_index += 1;
        }
    }

    fn current_index(&self) -> u32 {
        self.next_index
    }
}

fn map_stop(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::ToolUse => StopReason::ToolUse,
        FinishReason::MaxTokens => StopReason::MaxTokens,
        FinishReason::ContentFilter => StopReason::Refusal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(include_reasoning: bool, events: Vec<CanonicalEvent>) -> Vec<MessagesStreamEvent> {
        let mut enc = AnthropicStreamEncoder::new("msg_1", "m1", include_reasoning);
        let mut out = Vec::new();
        for event in events {
            out.extend(enc.encode(event));
        }
        out.extend(enc.finish());
        out
    }

    fn reasoning(text: &str) -> CanonicalEvent {
        CanonicalEvent::Reasoning {
            text: text.to_string(),
        }
    }

    fn text(value: &str) -> CanonicalEvent {
        CanonicalEvent::Text {
            text: value.to_string(),
        }
    }

    #[test]
    fn thinking_text_and_tool_blocks_index_gaplessly() {
        let out = drive(
            true,
            vec![
                reasoning("a"),
                reasoning("b"),
                text("ok"),
                CanonicalEvent::ToolCallStart {
                    id: "t1".to_string(),
                    name: "f".to_string(),
                },
                CanonicalEvent::ToolCallArgsDelta {
                    id: "t1".to_string(),
                    fragment: "{".to_string(),
                },
                CanonicalEvent::ToolCallArgsDelta {
                    id: "t1".to_string(),
                    fragment: "\"a\":1}".to_string(),
                },
                CanonicalEvent::Finish {
                    reason: FinishReason::ToolUse,
                },
            ],
        );

        let mut starts = Vec::new();
        let mut stops = Vec::new();
        for event in &out {
            match event {
                MessagesStreamEvent::ContentBlockStart { index, .. } => starts.push(*index),
                MessagesStreamEvent::ContentBlockStop { index } => stops.push(*index),
                _ => {}
            }
        }
        assert_eq!(starts, vec![0, 1, 2]);
        assert_eq!(stops, vec![0, 1, 2]);

        match &out[1] {
            MessagesStreamEvent::ContentBlockStart { content_block, .. } => {
                assert!(matches!(content_block, StreamContentBlock::Thinking { .. }));
            }
            other => panic!("expected thinking block start, got {other:?}"),
        }

        let stop_reason = out.iter().find_map(|event| match event {
            MessagesStreamEvent::MessageDelta { delta, .. } => delta.stop_reason,
            _ => None,
        });
        assert_eq!(stop_reason, Some(StopReason::ToolUse));
        assert!(matches!(out.last(), Some(MessagesStreamEvent::MessageStop)));
    }

    #[test]
    fn reasoning_is_dropped_when_not_requested() {
        let out = drive(false, vec![reasoning("secret"), text("ok")]);
        for event in &out {
            if let MessagesStreamEvent::ContentBlockStart { content_block, .. } = event {
                assert!(matches!(content_block, StreamContentBlock::Text { .. }));
            }
        }
    }

    #[test]
    fn message_start_precedes_everything_and_stop_is_unique() {
        let out = drive(false, vec![text("x")]);
        assert!(matches!(out[0], MessagesStreamEvent::MessageStart { .. }));
        let stops = out
            .iter()
            .filter(|event| matches!(event, MessagesStreamEvent::MessageStop))
            .count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn empty_stream_still_terminates_once() {
        let mut enc = AnthropicStreamEncoder::new("msg_1", "m1", false);
        let out = enc.finish();
        assert!(matches!(out[0], MessagesStreamEvent::MessageStart { .. }));
        assert!(matches!(out.last(), Some(MessagesStreamEvent::MessageStop)));
        assert!(enc.finish().is_empty());
    }
}
