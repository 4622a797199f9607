pub mod anthropic;
pub mod canonical;
pub mod chat;
pub mod error;
pub mod responses;
pub mod sse;
