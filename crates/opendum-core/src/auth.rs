use std::sync::Arc;

use http::HeaderMap;
use opendum_storage::{AccountStore, ModelAccess, hash_api_key};

#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub user_id: String,
    pub api_key_id: String,
    pub access: ModelAccess,
}

/// `Authorization: Bearer <key>` or `x-api-key: <key>`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    let auth = headers.get("authorization")?.to_str().ok()?.trim();
    for prefix in ["Bearer ", "bearer "] {
        if let Some(token) = auth.strip_prefix(prefix) {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Key lookup is by hash only; the raw secret is discarded immediately.
pub async fn authenticate(
    store: &Arc<dyn AccountStore>,
    api_key: &str,
) -> Option<CallerIdentity> {
    let key_hash = hash_api_key(api_key);
    let row = store.api_key_by_hash(&key_hash).await.ok()??;
    Some(CallerIdentity {
        user_id: row.user_id,
        api_key_id: row.id,
        access: row.access,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn bearer_and_api_key_headers_are_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer pk-1"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("pk-1"));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("pk-2"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("pk-2"));
    }

    #[test]
    fn x_api_key_wins_over_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("pk-a"));
        headers.insert("authorization", HeaderValue::from_static("Bearer pk-b"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("pk-a"));
    }

    #[test]
    fn missing_or_malformed_headers_yield_none() {
        assert!(extract_api_key(&HeaderMap::new()).is_none());
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(extract_api_key(&headers).is_none());
    }
}
