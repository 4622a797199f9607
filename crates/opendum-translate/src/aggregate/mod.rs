mod anthropic;
mod chat;

pub use anthropic::AnthropicAggregator;
pub use chat::ChatAggregator;
