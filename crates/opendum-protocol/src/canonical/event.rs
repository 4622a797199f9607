use serde::{Deserialize, Serialize};

/// Internal stream element bridging provider decoders and dialect
/// encoders. Decoders produce these in upstream arrival order; encoders
/// re-emit them in the caller's dialect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanonicalEvent {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCallStart {
        id: String,
        name: String,
    },
    /// Partial JSON string; fragments for one id arrive contiguously and
    /// concatenate to the full argument object.
    ToolCallArgsDelta {
        id: String,
        fragment: String,
    },
    ToolCallEnd {
        id: String,
    },
    Finish {
        reason: FinishReason,
    },
    Usage {
        usage: TokenUsage,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolUse,
    MaxTokens,
    ContentFilter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}
