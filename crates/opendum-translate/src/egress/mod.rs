mod anthropic;
mod responses;

pub use anthropic::canonical_to_anthropic;
pub use responses::canonical_to_responses;
