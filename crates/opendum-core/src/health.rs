use std::sync::Arc;

use opendum_protocol::error::{ErrorDetail, ErrorKind};
use opendum_storage::{AccountStatus, AccountStore, FailureRecord};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

const DEGRADED_THRESHOLD: i32 = 3;
const FAILED_THRESHOLD: i32 = 10;
const MAX_ERROR_MESSAGE_LEN: usize = 600;

/// Per-account failure bookkeeping: streak counters, status transitions
/// and the sanitized caller-facing error mapping.
pub struct FailureAccountant {
    store: Arc<dyn AccountStore>,
}

impl FailureAccountant {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self { store }
    }

    /// Best-effort; a storage hiccup never fails the request.
    pub async fn mark_success(&self, account_id: &str) {
        if let Err(err) = self.store.record_success(account_id).await {
            warn!(account = account_id, error = %err, "success accounting failed");
        }
    }

    pub async fn mark_failed(&self, account_id: &str, status_code: u16, body: &str) {
        let message = summarize_error_body(body);
        let streak = match self
            .store
            .record_failure(
                account_id,
                FailureRecord {
                    status_code,
                    message,
                },
            )
            .await
        {
            Ok(streak) => streak,
            Err(err) => {
                warn!(account = account_id, error = %err, "failure accounting failed");
                return;
            }
        };

        let transition = if streak >= FAILED_THRESHOLD {
            Some((AccountStatus::Failed, false))
        } else if streak >= DEGRADED_THRESHOLD {
            Some((AccountStatus::Degraded, true))
        } else {
            None
        };
        if let Some((status, is_active)) = transition {
            info!(account = account_id, status = status.as_str(), streak, "account status transition");
            if let Err(err) = self
                .store
                .set_account_status(account_id, status, is_active)
                .await
            {
                warn!(account = account_id, error = %err, "status transition write failed");
            }
        }
    }
}

/// Statuses worth trying another account for.
pub fn should_rotate(status: u16) -> bool {
    matches!(status, 401 | 402 | 403 | 408 | 429) || (500..600).contains(&status)
}

/// Upstream status → caller-facing (status, error body). Upstream text
/// never crosses this boundary.
pub fn sanitized_proxy_error(status: u16, retry_after_ms: Option<u64>) -> (u16, ErrorDetail) {
    match status {
        400 | 422 => (
            status,
            ErrorDetail::new(
                ErrorKind::InvalidRequestError,
                "Upstream rejected the request shape.",
            ),
        ),
        401 | 403 => (
            401,
            ErrorDetail::new(
                ErrorKind::AuthenticationError,
                "Upstream authentication failed.",
            ),
        ),
        429 => {
            let mut detail = ErrorDetail::new(
                ErrorKind::RateLimitError,
                "All available accounts are rate limited.",
            );
            if let Some(ms) = retry_after_ms {
                detail = detail.with_retry_after_ms(ms);
            }
            (429, detail)
        }
        408 => (
            408,
            ErrorDetail::new(ErrorKind::ApiError, "Upstream request timed out."),
        ),
        500..=599 => (
            502,
            ErrorDetail::new(ErrorKind::ApiError, "Upstream provider error."),
        ),
        _ => (
            500,
            ErrorDetail::new(ErrorKind::ApiError, "Unexpected upstream response."),
        ),
    }
}

/// Stored alongside the account for operators: truncated, with bulky
/// arrays and tool lists collapsed to key summaries.
pub fn summarize_error_body(body: &str) -> String {
    let summarized = match serde_json::from_str::<JsonValue>(body) {
        Ok(mut value) => {
            collapse_arrays(&mut value);
            value.to_string()
        }
        Err(_) => body.to_string(),
    };
    truncate(&summarized, MAX_ERROR_MESSAGE_LEN)
}

fn collapse_arrays(value: &mut JsonValue) {
    match value {
        JsonValue::Array(items) => {
            let summary = match items.first() {
                Some(JsonValue::Object(map)) => {
                    let keys: Vec<&str> = map.keys().map(|key| key.as_str()).collect();
                    format!("[{} items: {{{}}}]", items.len(), keys.join(","))
                }
                _ => format!("[{} items]", items.len()),
            };
            *value = JsonValue::String(summary);
        }
        JsonValue::Object(map) => {
            for nested in map.values_mut() {
                collapse_arrays(nested);
            }
        }
        _ => {}
    }
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut cut = max_len;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_statuses() {
        for status in [401, 402, 403, 408, 429, 500, 502, 529] {
            assert!(should_rotate(status), "{status} should rotate");
        }
        for status in [400, 404, 409, 422] {
            assert!(!should_rotate(status), "{status} should not rotate");
        }
    }

    #[test]
    fn sanitized_errors_never_leak_upstream_text() {
        let upstream_body = "secret internal upstream failure";
        let (status, detail) = sanitized_proxy_error(503, None);
        assert_eq!(status, 502);
        assert_eq!(detail.r#type, ErrorKind::ApiError);
        assert!(!detail.message.contains(upstream_body));
    }

    #[test]
    fn auth_failures_collapse_to_401() {
        let (status, detail) = sanitized_proxy_error(403, None);
        assert_eq!(status, 401);
        assert_eq!(detail.r#type, ErrorKind::AuthenticationError);
    }

    #[test]
    fn rate_limit_error_carries_wait() {
        let (status, detail) = sanitized_proxy_error(429, Some(120_000));
        assert_eq!(status, 429);
        assert_eq!(detail.retry_after_ms, Some(120_000));
        assert_eq!(detail.retry_after, Some(120));
    }

    #[test]
    fn arrays_collapse_to_key_summaries() {
        let body = r#"{"error":{"message":"bad tools","tools":[{"name":"a","parameters":{}},{"name":"b","parameters":{}}]}}"#;
        let summary = summarize_error_body(body);
        assert!(summary.contains("[2 items: {name,parameters}]"));
        assert!(!summary.contains("\"parameters\":{}"));
    }

    #[test]
    fn long_bodies_truncate() {
        let body = "x".repeat(5000);
        let summary = summarize_error_body(&body);
        assert!(summary.len() <= MAX_ERROR_MESSAGE_LEN + '…'.len_utf8());
    }
}
