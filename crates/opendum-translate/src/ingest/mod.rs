mod anthropic;
mod chat;
mod responses;

pub use anthropic::anthropic_to_canonical;
pub use chat::chat_to_canonical;
pub use responses::responses_to_canonical;
