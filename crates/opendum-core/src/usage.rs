use std::sync::Arc;
use std::time::Instant;

use opendum_storage::{AccountStore, NewUsageLog};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub user_id: String,
    pub api_key_id: Option<String>,
    pub provider_account_id: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub status_code: u16,
    pub started_at: Instant,
}

/// Fire-and-forget usage rows; a failed insert is logged and dropped,
/// never surfaced to the caller.
#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn AccountStore>,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self { store }
    }

    pub fn record(&self, event: UsageEvent) {
        let store = self.store.clone();
        let row = NewUsageLog {
            user_id: event.user_id,
            api_key_id: event.api_key_id,
            provider_account_id: event.provider_account_id,
            provider: event.provider,
            model: event.model,
            input_tokens: i64::from(event.input_tokens),
            output_tokens: i64::from(event.output_tokens),
            status_code: i32::from(event.status_code),
            duration_ms: event.started_at.elapsed().as_millis() as i64,
        };
        tokio::spawn(async move {
            if let Err(err) = store.insert_usage_log(row).await {
                warn!(error = %err, "usage log insert failed");
            }
        });
    }
}
