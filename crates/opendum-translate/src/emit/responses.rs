use opendum_protocol::canonical::{CanonicalEvent, FinishReason, TokenUsage};
use opendum_protocol::responses::response::{
    OutputContentPart, OutputItem, ResponseObject, ResponseUsage,
};
use opendum_protocol::responses::stream::ResponsesStreamEvent;

#[derive(Debug)]
struct FunctionCallState {
    call_id: String,
    name: String,
    arguments: String,
    output_index: u32,
}

/// Re-encodes canonical events as Responses-API stream events, keeping
/// enough state to assemble the final `response.completed` object.
/// Reasoning events are dropped; this dialect has no opt-in.
#[derive(Debug)]
pub struct ResponsesStreamEncoder {
    response_id: String,
    model: String,
    created_at: i64,
    next_output_index: u32,
    message_index: Option<u32>,
    message_text: String,
    calls: Vec<FunctionCallState>,
    open_call: Option<usize>,
    pending_finish: Option<FinishReason>,
    usage: Option<TokenUsage>,
    started: bool,
    terminated: bool,
}

impl ResponsesStreamEncoder {
    pub fn new(response_id: impl Into<String>, model: impl Into<String>, created_at: i64) -> Self {
        Self {
            response_id: response_id.into(),
            model: model.into(),
            created_at,
            next_output_index: 0,
            message_index: None,
            message_text: String::new(),
            calls: Vec::new(),
            open_call: None,
            pending_finish: None,
            usage: None,
            started: false,
            terminated: false,
        }
    }

    pub fn encode(&mut self, event: CanonicalEvent) -> Vec<ResponsesStreamEvent> {
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
                let index = self.ensure_message_item(&mut out);
                self.message_text.push_str(&text);
                out.push(ResponsesStreamEvent::OutputTextDelta {
                    item_id: Some(self.message_item_id()),
                    output_index: index,
                    delta: text,
                });
            }
            CanonicalEvent::Reasoning { .. } => {}
            CanonicalEvent::ToolCallStart { id, name } => {
                let output_index = self.next_output_index;
                self.next_output_index += 1;
                self.calls.push(FunctionCallState {
                    call_id: id.clone(),
                    name: name.clone(),
                    arguments: String::new(),
                    output_index,
                });
                self.open_call = Some(self.calls.len() - 1);
                out.push(ResponsesStreamEvent::OutputItemAdded {
                    output_index,
                    item: OutputItem::FunctionCall {
                        id: format!("fc_{}", trimmed_call_id(&id)),
                        call_id: id,
                        name,
                        arguments: String::new(),
                        status: "in_progress".to_string(),
                    },
                });
            }
            CanonicalEvent::ToolCallArgsDelta { id, fragment } => {
                if fragment.is_empty() {
                    return out;
                }
                let Some(position) = self.call_position(&id) else {
                    return out;
                };
                let call = &mut self.calls[position];
                call.arguments.push_str(&fragment);
                out.push(ResponsesStreamEvent::FunctionCallArgumentsDelta {
                    item_id: Some(format!("fc_{}", trimmed_call_id(&id))),
                    output_index: call.output_index,
                    delta: fragment,
                });
            }
            CanonicalEvent::ToolCallEnd { id } => {
                let Some(position) = self.call_position(&id) else {
                    return out;
                };
                let call = &self.calls[position];
                out.push(ResponsesStreamEvent::FunctionCallArgumentsDone {
                    item_id: Some(format!("fc_{}", trimmed_call_id(&id))),
                    output_index: call.output_index,
                    arguments: call.arguments.clone(),
                });
                out.push(ResponsesStreamEvent::OutputItemDone {
                    output_index: call.output_index,
                    item: OutputItem::FunctionCall {
                        id: format!("fc_{}", trimmed_call_id(&id)),
                        call_id: call.call_id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        status: "completed".to_string(),
                    },
                });
                if self.open_call == Some(position) {
                    self.open_call = None;
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

    /// Emits `response.completed` with the assembled output, exactly once.
    pub fn finish(&mut self) -> Vec<ResponsesStreamEvent> {
        if self.terminated {
            return Vec::new();
        }
        self.terminated = true;
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        if let Some(index) = self.message_index {
            out.push(ResponsesStreamEvent::OutputItemDone {
                output_index: index,
                item: self.message_item("completed"),
            });
        }
        out.push(ResponsesStreamEvent::Completed {
            response: self.response_object(self.final_status()),
        });
        out
    }

    /// `incomplete` when the upstream stopped on its token cap.
    pub fn final_status(&self) -> &'static str {
        match self.pending_finish {
            Some(FinishReason::MaxTokens) => "incomplete",
            _ => "completed",
        }
    }

    pub fn observed_usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    /// The assembled non-stream body; call after the event stream ends.
    pub fn response_object(&self, status: &str) -> ResponseObject {
        let mut output = Vec::new();
        if self.message_index.is_some() {
            output.push(self.message_item(status));
        }
        for call in &self.calls {
            output.push(OutputItem::FunctionCall {
                id: format!("fc_{}", trimmed_call_id(&call.call_id)),
                call_id: call.call_id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                status: "completed".to_string(),
            });
        }
        ResponseObject {
            id: self.response_id.clone(),
            object: "response".to_string(),
            created_at: self.created_at,
            status: status.to_string(),
            model: self.model.clone(),
            output,
            usage: self.usage.map(|usage| ResponseUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                total_tokens: usage.total(),
            }),
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<ResponsesStreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(ResponsesStreamEvent::Created {
            response: ResponseObject {
                id: self.response_id.clone(),
                object: "response".to_string(),
                created_at: self.created_at,
                status: "in_progress".to_string(),
                model: self.model.clone(),
                output: Vec::new(),
                usage: None,
            },
        });
    }

    fn ensure_message_item(&mut self, out: &mut Vec<ResponsesStreamEvent>) -> u32 {
        if let Some(index) = self.message_index {
            return index;
        }
        let index = self.next_output_index;
        self.next_output_index += 1;
        self.message_index = Some(index);
        out.push(ResponsesStreamEvent::OutputItemAdded {
            output_index: index,
            item: OutputItem::Message {
                id: self.message_item_id(),
                role: "assistant".to_string(),
                status: "in_progress".to_string(),
                content: Vec::new(),
            },
        });
        index
    }

    fn message_item(&self, status: &str) -> OutputItem {
        OutputItem::Message {
            id: self.message_item_id(),
            role: "assistant".to_string(),
            status: status.to_string(),
            content: vec![OutputContentPart {
                r#type: "output_text".to_string(),
                text: self.message_text.clone(),
            }],
        }
    }

    fn message_item_id(&self) -> String {
        format!("msg_{}", self.response_id)
    }

    fn call_position(&self, id: &str) -> Option<usize> {
        self.calls.iter().position(|call| call.call_id == id)
    }
}

fn trimmed_call_id(id: &str) -> &str {
    id.strip_prefix("call_").unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(events: Vec<CanonicalEvent>) -> Vec<ResponsesStreamEvent> {
        let mut enc = ResponsesStreamEncoder::new("resp_1", "m1", 1_700_000_000);
        let mut out = Vec::new();
        for event in events {
            out.extend(enc.encode(event));
        }
        out.extend(enc.finish());
        out
    }

    #[test]
    fn text_then_tool_call_produces_ordered_events() {
        let out = drive(vec![
            CanonicalEvent::Text {
                text: "ok".to_string(),
            },
            CanonicalEvent::ToolCallStart {
                id: "call_1".to_string(),
                name: "f".to_string(),
            },
            CanonicalEvent::ToolCallArgsDelta {
                id: "call_1".to_string(),
                fragment: "{}".to_string(),
            },
            CanonicalEvent::ToolCallEnd {
                id: "call_1".to_string(),
            },
            CanonicalEvent::Finish {
                reason: FinishReason::ToolUse,
            },
            CanonicalEvent::Usage {
                usage: TokenUsage {
                    input_tokens: 3,
                    output_tokens: 5,
                },
            },
        ]);

        assert!(matches!(out[0], ResponsesStreamEvent::Created { .. }));
        let names: Vec<&str> = out.iter().map(|event| event.event_name()).collect();
        assert!(names.contains(&"response.output_text.delta"));
        assert!(names.contains(&"response.function_call_arguments.delta"));
        assert_eq!(names.last().copied(), Some("response.completed"));

        match out.last().unwrap() {
            ResponsesStreamEvent::Completed { response } => {
                assert_eq!(response.output.len(), 2);
                let usage = response.usage.unwrap();
                assert_eq!(usage.total_tokens, 8);
                match &response.output[1] {
                    OutputItem::FunctionCall {
                        call_id, arguments, ..
                    } => {
                        assert_eq!(call_id, "call_1");
                        assert_eq!(arguments, "{}");
                    }
                    other => panic!("expected function call, got {other:?}"),
                }
            }
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[test]
    fn reasoning_is_dropped() {
        let out = drive(vec![
            CanonicalEvent::Reasoning {
                text: "secret".to_string(),
            },
            CanonicalEvent::Text {
                text: "visible".to_string(),
            },
        ]);
        for event in &out {
            assert_ne!(event.event_name(), "response.reasoning_text.delta");
        }
    }

    #[test]
    fn completed_is_emitted_exactly_once_on_eof() {
        let mut enc = ResponsesStreamEncoder::new("resp_1", "m1", 0);
        enc.encode(CanonicalEvent::Text {
            text: "x".to_string(),
        });
        let first = enc.finish();
        assert_eq!(
            first
                .iter()
                .filter(|event| event.event_name() == "response.completed")
                .count(),
            1
        );
        assert!(enc.finish().is_empty());
    }
}
