use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "opendum:ratelimit";
const MIN_COOLDOWN: Duration = Duration::from_secs(1);
const MAX_COOLDOWN: Duration = Duration::from_secs(30 * 24 * 3600);
const MAX_RETRY_AFTER_HEADER: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitEntry {
    /// Unix milliseconds.
    pub reset_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RateLimitEntry {
    fn remaining_ms(&self) -> i64 {
        self.reset_at_ms - now_ms()
    }

    fn is_live(&self) -> bool {
        self.remaining_ms() > 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedRateLimit {
    pub retry_after_ms: u64,
    pub model: Option<String>,
    pub message: Option<String>,
}

/// Per (account, family) cool-downs. A shared Redis cache is
/// authoritative when configured; the in-process map carries the same
/// semantics otherwise, and also absorbs cache outages.
pub struct RateLimitLedger {
    redis: Option<redis::aio::ConnectionManager>,
    local: RwLock<HashMap<String, RateLimitEntry>>,
}

impl RateLimitLedger {
    pub fn in_process() -> Self {
        Self {
            redis: None,
            local: RwLock::new(HashMap::new()),
        }
    }

    pub async fn connect(cache_url: Option<&str>) -> Self {
        let redis = match cache_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match client.get_connection_manager().await {
                    Ok(manager) => Some(manager),
                    Err(err) => {
                        warn!(error = %err, "rate-limit cache unreachable, using in-process map");
                        None
                    }
                },
                Err(err) => {
                    warn!(error = %err, "invalid cache url, using in-process map");
                    None
                }
            },
            None => None,
        };
        Self {
            redis,
            local: RwLock::new(HashMap::new()),
        }
    }

    pub async fn mark_rate_limited(
        &self,
        account_id: &str,
        family: &str,
        retry_after_ms: u64,
        model: Option<String>,
        message: Option<String>,
    ) {
        let cooldown = Duration::from_millis(retry_after_ms)
            .clamp(MIN_COOLDOWN, MAX_COOLDOWN);
        let entry = RateLimitEntry {
            reset_at_ms: now_ms() + cooldown.as_millis() as i64,
            model,
            message,
        };
        let key = self.key(account_id, family);
        debug!(account = account_id, family, cooldown_ms = cooldown.as_millis() as u64, "rate limit recorded");

        if let Some(mut redis) = self.redis.clone() {
            let payload = serde_json::to_string(&entry).unwrap_or_default();
            let result: Result<(), redis::RedisError> = redis::cmd("SET")
                .arg(&key)
                .arg(payload)
                .arg("PX")
                .arg(cooldown.as_millis() as u64)
                .query_async(&mut redis)
                .await;
            if let Err(err) = result {
                warn!(error = %err, "rate-limit cache write failed, keeping local entry");
            }
        }
        // Last writer wins, mirroring the shared cache.
        self.local.write().await.insert(key, entry);
    }

    pub async fn is_rate_limited(&self, account_id: &str, family: &str) -> bool {
        self.entry(account_id, family).await.is_some()
    }

    /// Remaining cool-down for the freest listed account; 0 when any one
    /// of them is not limited.
    pub async fn min_wait_ms(&self, account_ids: &[String], family: &str) -> u64 {
        let mut min_wait: Option<i64> = None;
        for account_id in account_ids {
            match self.entry(account_id, family).await {
                Some(entry) => {
                    let remaining = entry.remaining_ms().max(0);
                    min_wait = Some(min_wait.map_or(remaining, |current| current.min(remaining)));
                }
                None => return 0,
            }
        }
        min_wait.unwrap_or(0).max(0) as u64
    }

    pub async fn rate_limited_ids(&self, account_ids: &[String], family: &str) -> Vec<String> {
        let mut limited = Vec::new();
        for account_id in account_ids {
            if self.is_rate_limited(account_id, family).await {
                limited.push(account_id.clone());
            }
        }
        limited
    }

    async fn entry(&self, account_id: &str, family: &str) -> Option<RateLimitEntry> {
        let key = self.key(account_id, family);
        if let Some(mut redis) = self.redis.clone() {
            let fetched: Result<Option<String>, redis::RedisError> =
                redis::cmd("GET").arg(&key).query_async(&mut redis).await;
            match fetched {
                Ok(Some(raw)) => {
                    if let Ok(entry) = serde_json::from_str::<RateLimitEntry>(&raw)
                        && entry.is_live()
                    {
                        return Some(entry);
                    }
                    return None;
                }
                Ok(None) => return None,
                Err(err) => {
                    warn!(error = %err, "rate-limit cache read failed, falling back to local map");
                }
            }
        }
        let guard = self.local.read().await;
        guard.get(&key).filter(|entry| entry.is_live()).cloned()
    }

    fn key(&self, account_id: &str, family: &str) -> String {
        format!("{KEY_PREFIX}:{account_id}:{family}")
    }
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// `retry-after-ms` (milliseconds) wins over `retry-after` (seconds);
/// both are capped at 24h.
pub fn parse_retry_after_ms(headers: &[(String, String)]) -> Option<u64> {
    let lookup = |name: &str| {
        headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.trim())
    };
    let ms = if let Some(raw) = lookup("retry-after-ms") {
        raw.parse::<u64>().ok()?
    } else if let Some(raw) = lookup("retry-after") {
        raw.parse::<u64>().ok()?.saturating_mul(1000)
    } else {
        return None;
    };
    Some(ms.min(MAX_RETRY_AFTER_HEADER.as_millis() as u64))
}

/// Walks a provider 429 body for RetryInfo / ErrorInfo detail entries.
/// Returns None only when the body is not recognizable as a rate-limit
/// payload at all; recognized payloads without a parseable duration get
/// the 1h default.
pub fn parse_rate_limit_error(body: &str) -> Option<ParsedRateLimit> {
    let value: JsonValue = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    let message = error
        .get("message")
        .and_then(|message| message.as_str())
        .map(|message| message.to_string());

    let mut parsed = ParsedRateLimit {
        retry_after_ms: DEFAULT_COOLDOWN.as_millis() as u64,
        model: None,
        message,
    };

    let details = error.get("details").and_then(|details| details.as_array());
    let Some(details) = details else {
        // A plain {"error": {...}} body still counts when its message
        // reads like a quota complaint.
        let looks_limited = parsed
            .message
            .as_deref()
            .map(|message| {
                let lower = message.to_ascii_lowercase();
                lower.contains("quota") || lower.contains("rate limit") || lower.contains("exhausted")
            })
            .unwrap_or(false);
        return looks_limited.then_some(parsed);
    };

    let mut recognized = false;
    for detail in details {
        let type_tag = detail
            .get("@type")
            .and_then(|tag| tag.as_str())
            .unwrap_or_default();
        if type_tag.ends_with("RetryInfo") {
            recognized = true;
            if let Some(delay) = detail.get("retryDelay").and_then(|delay| delay.as_str())
                && let Some(duration) = parse_duration(delay)
            {
                parsed.retry_after_ms = duration.as_millis() as u64;
            }
        } else if type_tag.ends_with("ErrorInfo") {
            recognized = true;
            if let Some(metadata) = detail.get("metadata").and_then(|meta| meta.as_object()) {
                if let Some(model) = metadata.get("model").and_then(|model| model.as_str()) {
                    parsed.model = Some(model.to_string());
                }
                for value in metadata.values() {
                    if let Some(text) = value.as_str()
                        && let Some(duration) = parse_duration(text)
                    {
                        parsed.retry_after_ms = duration.as_millis() as u64;
                    }
                }
            }
        }
    }
    recognized.then_some(parsed)
}

/// `128h12m18.72s` style durations: any of h/m/s, in order, fractional
/// seconds allowed.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut matched = false;
    for ch in raw.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
            continue;
        }
        let value: f64 = number.parse().ok()?;
        number.clear();
        let unit_secs = match ch {
            'h' => 3600.0,
            'm' => 60.0,
            's' => 1.0,
            _ => return None,
        };
        total += Duration::from_secs_f64(value * unit_secs);
        matched = true;
    }
    if !number.is_empty() {
        // Trailing bare number is not a valid unit suffix.
        return None;
    }
    matched.then_some(total)
}

/// Human form of a wait, mirroring the duration syntax above:
/// 120000ms → "2m", 7_398_720ms → "2h3m18.72s".
pub fn format_wait_time(ms: u64) -> String {
    let total_secs = ms as f64 / 1000.0;
    let hours = (total_secs / 3600.0).floor() as u64;
    let minutes = ((total_secs - hours as f64 * 3600.0) / 60.0).floor() as u64;
    let seconds = total_secs - hours as f64 * 3600.0 - minutes as f64 * 60.0;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if seconds > 0.0 || out.is_empty() {
        if (seconds - seconds.floor()).abs() < 1e-9 {
            out.push_str(&format!("{}s", seconds as u64));
        } else {
            out.push_str(&format!("{seconds:.2}s"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mark_then_read_round_trip() {
        let ledger = RateLimitLedger::in_process();
        assert!(!ledger.is_rate_limited("a1", "claude").await);
        ledger
            .mark_rate_limited("a1", "claude", 120_000, None, None)
            .await;
        assert!(ledger.is_rate_limited("a1", "claude").await);
        // Scope isolation: other families and accounts stay free.
        assert!(!ledger.is_rate_limited("a1", "gpt").await);
        assert!(!ledger.is_rate_limited("a2", "claude").await);
    }

    #[tokio::test]
    async fn min_wait_is_zero_when_any_account_is_free() {
        let ledger = RateLimitLedger::in_process();
        ledger
            .mark_rate_limited("a1", "claude", 120_000, None, None)
            .await;
        let ids = vec!["a1".to_string(), "a2".to_string()];
        assert_eq!(ledger.min_wait_ms(&ids, "claude").await, 0);
    }

    #[tokio::test]
    async fn min_wait_picks_the_earliest_reset() {
        let ledger = RateLimitLedger::in_process();
        ledger
            .mark_rate_limited("a1", "claude", 120_000, None, None)
            .await;
        ledger
            .mark_rate_limited("a2", "claude", 300_000, None, None)
            .await;
        let ids = vec!["a1".to_string(), "a2".to_string()];
        let wait = ledger.min_wait_ms(&ids, "claude").await;
        assert!(wait > 110_000 && wait <= 120_000, "wait was {wait}");
    }

    #[tokio::test]
    async fn cooldown_is_clamped_to_at_least_one_second() {
        let ledger = RateLimitLedger::in_process();
        ledger.mark_rate_limited("a1", "claude", 0, None, None).await;
        assert!(ledger.is_rate_limited("a1", "claude").await);
    }

    #[test]
    fn retry_after_headers_parse_in_both_units() {
        let ms_header = vec![("retry-after-ms".to_string(), "1500".to_string())];
        assert_eq!(parse_retry_after_ms(&ms_header), Some(1500));

        let sec_header = vec![("Retry-After".to_string(), "30".to_string())];
        assert_eq!(parse_retry_after_ms(&sec_header), Some(30_000));

        let huge = vec![("retry-after".to_string(), "999999999".to_string())];
        assert_eq!(parse_retry_after_ms(&huge), Some(86_400_000));

        assert_eq!(parse_retry_after_ms(&[]), None);
    }

    #[test]
    fn duration_parser_handles_compound_values() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        let long = parse_duration("128h12m18.72s").unwrap();
        assert_eq!(long.as_millis(), (128 * 3600 + 12 * 60) as u128 * 1000 + 18_720);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("15"), None);
    }

    #[test]
    fn wait_formatting_round_trips_durations() {
        for raw in ["2m", "30s", "2h3m18.72s", "1h"] {
            let parsed = parse_duration(raw).unwrap();
            assert_eq!(format_wait_time(parsed.as_millis() as u64), raw);
        }
        assert_eq!(format_wait_time(0), "0s");
    }

    #[test]
    fn google_style_bodies_parse() {
        let body = r#"{
            "error": {
                "code": 429,
                "message": "Resource has been exhausted",
                "details": [
                    {
                        "@type": "type.googleapis.com/google.rpc.ErrorInfo",
                        "reason": "RATE_LIMIT_EXCEEDED",
                        "metadata": { "model": "gemini-2.5-pro", "retryDelay": "128h12m18.72s" }
                    },
                    {
                        "@type": "type.googleapis.com/google.rpc.RetryInfo",
                        "retryDelay": "30s"
                    }
                ]
            }
        }"#;
        let parsed = parse_rate_limit_error(body).unwrap();
        assert_eq!(parsed.model.as_deref(), Some("gemini-2.5-pro"));
        assert_eq!(parsed.retry_after_ms, 30_000);
    }

    #[test]
    fn unrecognizable_bodies_yield_none() {
        assert!(parse_rate_limit_error("not json").is_none());
        assert!(parse_rate_limit_error(r#"{"error":{"message":"boom"}}"#).is_none());
    }

    #[test]
    fn quota_message_without_details_gets_default_cooldown() {
        let parsed =
            parse_rate_limit_error(r#"{"error":{"message":"Quota exceeded for model"}}"#).unwrap();
        assert_eq!(parsed.retry_after_ms, 3_600_000);
    }
}
