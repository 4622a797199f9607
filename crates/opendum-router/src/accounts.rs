use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{delete, get, post};
use bytes::Bytes;
use opendum_core::accounts::OnboardingError;
use opendum_core::engine::Dialect;
use opendum_storage::AccountRow;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::proxy::{AppState, authenticate_caller, json_response};

pub fn accounts_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/accounts", get(list_accounts))
        .route("/v1/accounts/oauth/start", post(oauth_start))
        .route("/v1/accounts/oauth/callback", post(oauth_callback))
        .route("/v1/accounts/device/start", post(device_start))
        .route("/v1/accounts/device/poll", post(device_poll))
        .route("/v1/accounts/{id}/rename", post(rename_account))
        .route("/v1/accounts/{id}/enable", post(enable_account))
        .route("/v1/accounts/{id}/disable", post(disable_account))
        .route("/v1/accounts/{id}/reset", post(reset_account))
        .route("/v1/accounts/{id}", delete(delete_account))
        .with_state(state)
}

/// Caller-visible account projection; token columns never leave the
/// store decrypted except toward upstreams.
#[derive(Debug, Serialize)]
struct AccountView {
    id: String,
    provider: String,
    name: Option<String>,
    email: Option<String>,
    status: &'static str,
    is_active: bool,
    request_count: i64,
    success_count: i64,
    error_count: i64,
    consecutive_errors: i32,
    last_used_at: Option<String>,
    last_error_at: Option<String>,
    last_error_code: Option<i32>,
    expires_at: Option<String>,
}

impl From<AccountRow> for AccountView {
    fn from(row: AccountRow) -> Self {
        Self {
            id: row.id,
            provider: row.provider,
            name: row.name,
            email: row.email,
            status: row.status.as_str(),
            is_active: row.is_active,
            request_count: row.request_count,
            success_count: row.success_count,
            error_count: row.error_count,
            consecutive_errors: row.consecutive_errors,
            last_used_at: format_ts(row.last_used_at),
            last_error_at: format_ts(row.last_error_at),
            last_error_code: row.last_error_code,
            expires_at: format_ts(row.expires_at),
        }
    }
}

fn format_ts(ts: Option<OffsetDateTime>) -> Option<String> {
    ts.and_then(|ts| ts.format(&Rfc3339).ok())
}

#[derive(Debug, Deserialize)]
struct OAuthStartBody {
    provider: String,
    #[serde(default)]
    redirect_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthCallbackBody {
    state: String,
    code: String,
}

#[derive(Debug, Deserialize)]
struct DeviceStartBody {
    provider: String,
}

#[derive(Debug, Deserialize)]
struct DevicePollBody {
    state: String,
}

#[derive(Debug, Deserialize)]
struct RenameBody {
    name: String,
}

async fn list_accounts(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let caller = match authenticate_caller(&state, &headers, Dialect::Chat).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    match state.store.accounts_for_user(&caller.user_id).await {
        Ok(rows) => {
            let views: Vec<AccountView> = rows.into_iter().map(AccountView::from).collect();
            json_response(
                StatusCode::OK,
                serde_json::json!({ "accounts": views }),
            )
        }
        Err(err) => storage_error(&err),
    }
}

async fn oauth_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let _caller = match authenticate_caller(&state, &headers, Dialect::Chat).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    let Ok(request) = serde_json::from_slice::<OAuthStartBody>(&body) else {
        return bad_request("malformed body");
    };
    match state
        .onboarding
        .oauth_start(&request.provider, request.redirect_uri.as_deref())
    {
        Ok(start) => json_response(
            StatusCode::OK,
            serde_json::json!({ "auth_url": start.auth_url, "state": start.state }),
        ),
        Err(err) => onboarding_error(err),
    }
}

async fn oauth_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let caller = match authenticate_caller(&state, &headers, Dialect::Chat).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    let Ok(request) = serde_json::from_slice::<OAuthCallbackBody>(&body) else {
        return bad_request("malformed body");
    };
    match state
        .onboarding
        .oauth_callback(&caller.user_id, &request.state, &request.code)
        .await
    {
        Ok(account) => json_response(
            StatusCode::OK,
            serde_json::json!({ "account": AccountView::from(account) }),
        ),
        Err(err) => onboarding_error(err),
    }
}

async fn device_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let _caller = match authenticate_caller(&state, &headers, Dialect::Chat).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    let Ok(request) = serde_json::from_slice::<DeviceStartBody>(&body) else {
        return bad_request("malformed body");
    };
    match state.onboarding.device_start(&request.provider).await {
        Ok(start) => json_response(
            StatusCode::OK,
            serde_json::to_value(&start).unwrap_or_default(),
        ),
        Err(err) => onboarding_error(err),
    }
}

async fn device_poll(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let caller = match authenticate_caller(&state, &headers, Dialect::Chat).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    let Ok(request) = serde_json::from_slice::<DevicePollBody>(&body) else {
        return bad_request("malformed body");
    };
    match state
        .onboarding
        .device_poll(&caller.user_id, &request.state)
        .await
    {
        Ok(account) => json_response(
            StatusCode::OK,
            serde_json::json!({ "status": "authorized", "account": AccountView::from(account) }),
        ),
        Err(OnboardingError::Pending) => json_response(
            StatusCode::ACCEPTED,
            serde_json::json!({ "status": "pending" }),
        ),
        Err(err) => onboarding_error(err),
    }
}

async fn rename_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let caller = match authenticate_caller(&state, &headers, Dialect::Chat).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    let Ok(request) = serde_json::from_slice::<RenameBody>(&body) else {
        return bad_request("malformed body");
    };
    match require_owned(&state, &caller.user_id, &id).await {
        Ok(_) => match state.store.rename_account(&id, &request.name).await {
            Ok(()) => json_response(StatusCode::OK, serde_json::json!({ "ok": true })),
            Err(err) => storage_error(&err),
        },
        Err(response) => response,
    }
}

async fn enable_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    set_enabled(state, id, headers, true).await
}

async fn disable_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    set_enabled(state, id, headers, false).await
}

async fn set_enabled(state: AppState, id: String, headers: HeaderMap, enabled: bool) -> Response {
    let caller = match authenticate_caller(&state, &headers, Dialect::Chat).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    match require_owned(&state, &caller.user_id, &id).await {
        Ok(_) => match state.store.set_account_enabled(&id, enabled).await {
            Ok(()) => json_response(StatusCode::OK, serde_json::json!({ "ok": true })),
            Err(err) => storage_error(&err),
        },
        Err(response) => response,
    }
}

async fn reset_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate_caller(&state, &headers, Dialect::Chat).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    match require_owned(&state, &caller.user_id, &id).await {
        Ok(_) => match state.store.reset_account_counters(&id).await {
            Ok(()) => json_response(StatusCode::OK, serde_json::json!({ "ok": true })),
            Err(err) => storage_error(&err),
        },
        Err(response) => response,
    }
}

async fn delete_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate_caller(&state, &headers, Dialect::Chat).await {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    match require_owned(&state, &caller.user_id, &id).await {
        Ok(_) => match state.store.delete_account(&id).await {
            Ok(()) => json_response(StatusCode::OK, serde_json::json!({ "ok": true })),
            Err(err) => storage_error(&err),
        },
        Err(response) => response,
    }
}

async fn require_owned(
    state: &AppState,
    user_id: &str,
    account_id: &str,
) -> Result<AccountRow, Response> {
    match state.store.account_by_id(account_id).await {
        Ok(Some(account)) if account.user_id == user_id => Ok(account),
        Ok(_) => Err(json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": { "type": "invalid_request_error", "message": "account not found" } }),
        )),
        Err(err) => Err(storage_error(&err)),
    }
}

fn bad_request(message: &str) -> Response {
    json_response(
        StatusCode::BAD_REQUEST,
        serde_json::json!({ "error": { "type": "invalid_request_error", "message": message } }),
    )
}

fn storage_error(err: &opendum_storage::StorageError) -> Response {
    tracing::warn!(error = %err, "storage operation failed");
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        serde_json::json!({ "error": { "type": "api_error", "message": "Internal proxy error." } }),
    )
}

fn onboarding_error(err: OnboardingError) -> Response {
    let (status, message) = match &err {
        OnboardingError::UnknownProvider(provider) => (
            StatusCode::BAD_REQUEST,
            format!("unknown provider `{provider}`"),
        ),
        OnboardingError::UnknownState => {
            (StatusCode::BAD_REQUEST, "unknown or expired state".to_string())
        }
        OnboardingError::Pending => (StatusCode::ACCEPTED, "authorization pending".to_string()),
        OnboardingError::Denied(reason) => (StatusCode::BAD_REQUEST, reason.clone()),
        OnboardingError::Provider(_) | OnboardingError::Storage(_) => {
            tracing::warn!(error = %err, "onboarding failed");
            (
                StatusCode::BAD_GATEWAY,
                "provider authorization failed".to_string(),
            )
        }
    };
    json_response(
        status,
        serde_json::json!({ "error": { "type": "invalid_request_error", "message": message } }),
    )
}
