pub mod event;
pub mod request;

pub use event::{CanonicalEvent, FinishReason, TokenUsage};
pub use request::{
    CanonicalMessage, CanonicalRequest, CanonicalRole, CanonicalTool, CanonicalToolCall,
    CanonicalToolChoice,
};
