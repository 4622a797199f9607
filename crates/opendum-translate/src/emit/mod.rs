mod anthropic;
mod chat;
mod responses;

pub use anthropic::AnthropicStreamEncoder;
pub use chat::{ChatStreamEncoder, ChatStreamItem};
pub use responses::ResponsesStreamEncoder;
