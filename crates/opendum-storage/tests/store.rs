use opendum_storage::entities;
use opendum_storage::{
    AccountStatus, AccountStore, CredentialUpdate, FailureRecord, FieldCipher, ModelAccess,
    NewAccount, NewUsageLog, SeaOrmStore, hash_api_key,
};
use sea_orm::{ActiveValue, EntityTrait};
use time::OffsetDateTime;

async fn memory_store() -> SeaOrmStore {
    let store = SeaOrmStore::connect("sqlite::memory:", FieldCipher::from_secret("test-secret"))
        .await
        .expect("sqlite connect");
    store.schema_sync().await.expect("schema sync");
    store
}

fn new_account(user_id: &str, provider_account_id: Option<&str>) -> NewAccount {
    NewAccount {
        user_id: user_id.to_string(),
        provider: "claude".to_string(),
        name: Some("primary".to_string()),
        email: Some("dev@example.com".to_string()),
        provider_account_id: provider_account_id.map(|id| id.to_string()),
        access_token: "at-secret".to_string(),
        refresh_token: "rt-secret".to_string(),
        api_key: None,
        project_id: None,
        tier: None,
        expires_at: Some(OffsetDateTime::now_utc() + time::Duration::hours(8)),
    }
}

#[tokio::test]
async fn tokens_are_encrypted_at_rest_and_decrypted_on_read() {
    let store = memory_store().await;
    let account = store.upsert_account(new_account("u1", None)).await.unwrap();
    assert_eq!(account.access_token, "at-secret");
    assert_eq!(account.refresh_token, "rt-secret");

    // The raw row must not contain the plaintext.
    let raw = entities::ProviderAccounts::find_by_id(account.id.clone())
        .one(store.connection())
        .await
        .unwrap()
        .unwrap();
    assert_ne!(raw.access_token, "at-secret");
    assert_ne!(raw.refresh_token, "rt-secret");
}

#[tokio::test]
async fn upsert_dedupes_on_provider_identity() {
    let store = memory_store().await;
    let first = store
        .upsert_account(new_account("u1", Some("upstream-1")))
        .await
        .unwrap();
    let mut again = new_account("u1", Some("upstream-1"));
    again.access_token = "at-rotated".to_string();
    let second = store.upsert_account(again).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.access_token, "at-rotated");
    assert_eq!(store.accounts_for_user("u1").await.unwrap().len(), 1);

    // A different upstream identity gets its own row.
    store
        .upsert_account(new_account("u1", Some("upstream-2")))
        .await
        .unwrap();
    assert_eq!(store.accounts_for_user("u1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn credential_update_keeps_unset_fields() {
    let store = memory_store().await;
    let account = store.upsert_account(new_account("u1", None)).await.unwrap();
    let new_expiry = OffsetDateTime::now_utc() + time::Duration::hours(16);
    store
        .update_credentials(
            &account.id,
            CredentialUpdate {
                access_token: Some("at-new".to_string()),
                expires_at: Some(new_expiry),
                ..CredentialUpdate::default()
            },
        )
        .await
        .unwrap();

    let updated = store.account_by_id(&account.id).await.unwrap().unwrap();
    assert_eq!(updated.access_token, "at-new");
    assert_eq!(updated.refresh_token, "rt-secret");
    assert!(updated.expires_at.unwrap() > account.expires_at.unwrap());
}

#[tokio::test]
async fn failure_and_success_counters_track_single_rows() {
    let store = memory_store().await;
    let account = store.upsert_account(new_account("u1", None)).await.unwrap();

    let streak = store
        .record_failure(
            &account.id,
            FailureRecord {
                status_code: 500,
                message: "boom".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(streak, 1);
    let streak = store
        .record_failure(
            &account.id,
            FailureRecord {
                status_code: 503,
                message: "still down".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(streak, 2);

    let row = store.account_by_id(&account.id).await.unwrap().unwrap();
    assert_eq!(row.error_count, 2);
    assert_eq!(row.last_error_code, Some(503));
    assert_eq!(row.last_error_message.as_deref(), Some("still down"));

    store.record_success(&account.id).await.unwrap();
    let row = store.account_by_id(&account.id).await.unwrap().unwrap();
    assert_eq!(row.consecutive_errors, 0);
    assert_eq!(row.success_count, 1);
    assert_eq!(row.status, AccountStatus::Active);

    store.touch_account_usage(&account.id).await.unwrap();
    let row = store.account_by_id(&account.id).await.unwrap().unwrap();
    assert_eq!(row.request_count, 1);
    assert!(row.last_used_at.is_some());
}

#[tokio::test]
async fn expiring_filter_only_returns_active_soon_to_expire_rows() {
    let store = memory_store().await;
    let soon = store.upsert_account(new_account("u1", None)).await.unwrap();
    let mut later = new_account("u1", None);
    later.expires_at = Some(OffsetDateTime::now_utc() + time::Duration::days(7));
    let later = store.upsert_account(later).await.unwrap();
    let disabled = store.upsert_account(new_account("u2", None)).await.unwrap();
    store.set_account_enabled(&disabled.id, false).await.unwrap();

    let cutoff = OffsetDateTime::now_utc() + time::Duration::hours(24);
    let expiring = store.accounts_expiring_before(cutoff).await.unwrap();
    let ids: Vec<&str> = expiring.iter().map(|row| row.id.as_str()).collect();
    assert!(ids.contains(&soon.id.as_str()));
    assert!(!ids.contains(&later.id.as_str()));
    assert!(!ids.contains(&disabled.id.as_str()));
}

#[tokio::test]
async fn api_keys_are_looked_up_by_hash_only() {
    let store = memory_store().await;
    let secret = "pk-test-1";
    let active = entities::proxy_api_keys::ActiveModel {
        id: ActiveValue::Set("key-1".to_string()),
        user_id: ActiveValue::Set("u1".to_string()),
        name: ActiveValue::Set(Some("ci".to_string())),
        key_hash: ActiveValue::Set(hash_api_key(secret)),
        model_access_mode: ActiveValue::Set("allowlist".to_string()),
        model_access_list: ActiveValue::Set(serde_json::json!(["claude-sonnet-4-5"])),
        created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
    };
    entities::ProxyApiKeys::insert(active)
        .exec(store.connection())
        .await
        .unwrap();

    let row = store
        .api_key_by_hash(&hash_api_key(secret))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.user_id, "u1");
    assert_eq!(
        row.access,
        ModelAccess::Allowlist(vec!["claude-sonnet-4-5".to_string()])
    );
    assert!(row.access.permits("claude-sonnet-4-5"));
    assert!(!row.access.permits("gpt-5"));

    // The raw secret never matches.
    assert!(store.api_key_by_hash(secret).await.unwrap().is_none());
}

#[tokio::test]
async fn usage_logs_and_disabled_models_round_trip() {
    let store = memory_store().await;
    store
        .insert_usage_log(NewUsageLog {
            user_id: "u1".to_string(),
            api_key_id: Some("key-1".to_string()),
            provider_account_id: "acct-1".to_string(),
            provider: "claude".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            input_tokens: 4,
            output_tokens: 7,
            status_code: 200,
            duration_ms: 120,
        })
        .await
        .unwrap();
    let rows = entities::UsageLogs::find()
        .all(store.connection())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].input_tokens, 4);

    let active = entities::disabled_models::ActiveModel {
        id: ActiveValue::NotSet,
        model: ActiveValue::Set("gpt-5".to_string()),
        created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
    };
    entities::DisabledModels::insert(active)
        .exec(store.connection())
        .await
        .unwrap();
    assert_eq!(store.disabled_models().await.unwrap(), vec!["gpt-5"]);
}
