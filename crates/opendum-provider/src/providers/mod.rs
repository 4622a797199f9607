mod claude;
mod codex;
mod gemini;

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use gemini::GeminiAdapter;

use std::sync::Arc;

use crate::client::HttpClient;
use crate::registry::ProviderRegistry;

/// Registry with every built-in adapter wired to one shared client.
pub fn default_registry(http: HttpClient) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(ClaudeAdapter::new(http.clone())));
    registry.register(Arc::new(CodexAdapter::new(http.clone())));
    registry.register(Arc::new(GeminiAdapter::new(http)));
    registry
}

pub(crate) fn expires_at_from_expires_in(expires_in: Option<u64>) -> Option<time::OffsetDateTime> {
    expires_in.map(|secs| time::OffsetDateTime::now_utc() + time::Duration::seconds(secs as i64))
}
