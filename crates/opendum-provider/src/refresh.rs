use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opendum_storage::{AccountRow, AccountStore, CredentialUpdate};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::registry::ProviderRegistry;
use crate::{ProviderError, ProviderKind, UpstreamCredential};

/// Buffer before `expires_at` at which a request-path refresh kicks in.
pub const REQUEST_REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential_expired")]
    Expired,
    #[error("unknown provider tag `{0}`")]
    UnknownProvider(String),
    #[error("account vanished during refresh")]
    AccountGone,
    #[error("storage error: {0}")]
    Storage(#[from] opendum_storage::StorageError),
    #[error("refresh failed: {0}")]
    Refresh(#[from] ProviderError),
}

/// Cooperative token refresh. At most one refresh per account runs at a
/// time in this process; followers re-read the row and observe the
/// winner's tokens. Cross-process races resolve by last row write.
pub struct CredentialService {
    store: Arc<dyn AccountStore>,
    registry: Arc<ProviderRegistry>,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialService {
    pub fn new(store: Arc<dyn AccountStore>, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            store,
            registry,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a credential valid for at least the buffer window, along
    /// with the (possibly refreshed) account row.
    pub async fn get_valid_credentials(
        &self,
        account: &AccountRow,
        buffer: Duration,
    ) -> Result<(UpstreamCredential, AccountRow), CredentialError> {
        if !expiring(account, buffer) {
            return Ok((credential_of(account), account.clone()));
        }

        let lock = self.lock_for(&account.id);
        let _guard = lock.lock().await;

        // A concurrent winner may have refreshed while we waited.
        let current = self
            .store
            .account_by_id(&account.id)
            .await?
            .ok_or(CredentialError::AccountGone)?;
        if !expiring(&current, buffer) {
            return Ok((credential_of(&current), current));
        }

        match self.refresh_account(&current).await {
            Ok(refreshed) => Ok((credential_of(&refreshed), refreshed)),
            Err(err) => {
                if !expired(&current) {
                    // Not yet past expiry: the stored token may still be
                    // honored upstream. Fall back rather than failing the
                    // request outright.
                    warn!(
                        account = %current.id,
                        error = %err,
                        "token refresh failed inside buffer, using stored credential"
                    );
                    return Ok((credential_of(&current), current));
                }
                Err(err)
            }
        }
    }

    /// Refreshes unconditionally and persists the rotated tokens. Used
    /// by the request path above and by the proactive refresher.
    pub async fn refresh_account(&self, account: &AccountRow) -> Result<AccountRow, CredentialError> {
        let kind = ProviderKind::parse(&account.provider)
            .ok_or_else(|| CredentialError::UnknownProvider(account.provider.clone()))?;
        let adapter = self
            .registry
            .get(kind)
            .ok_or_else(|| CredentialError::UnknownProvider(account.provider.clone()))?;

        let result = adapter.refresh_token(&account.refresh_token).await?;

        // The new refresh token must be durable before anything uses it;
        // upstreams invalidate the old one on rotation.
        self.store
            .update_credentials(
                &account.id,
                CredentialUpdate {
                    access_token: Some(result.access_token.clone()),
                    refresh_token: result.refresh_token.clone(),
                    api_key: result.api_key.clone(),
                    project_id: result.project_id.clone(),
                    tier: result.tier.clone(),
                    expires_at: result.expires_at,
                },
            )
            .await?;

        debug!(account = %account.id, provider = %account.provider, "credential refreshed");
        self.store
            .account_by_id(&account.id)
            .await?
            .ok_or(CredentialError::AccountGone)
    }

    fn lock_for(&self, account_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.inflight.lock().unwrap_or_else(|poisoned| {
            // A panicking holder leaves the map intact; keep going.
            poisoned.into_inner()
        });
        guard
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn expiring(account: &AccountRow, buffer: Duration) -> bool {
    match account.expires_at {
        Some(expires_at) => OffsetDateTime::now_utc() + buffer > expires_at,
        // No recorded expiry (API-key style account): never refresh.
        None => false,
    }
}

fn expired(account: &AccountRow) -> bool {
    match account.expires_at {
        Some(expires_at) => OffsetDateTime::now_utc() > expires_at,
        None => false,
    }
}

fn credential_of(account: &AccountRow) -> UpstreamCredential {
    UpstreamCredential {
        access_token: account.access_token.clone(),
        account_id: account.provider_account_id.clone(),
        api_key: account.api_key.clone(),
        project_id: account.project_id.clone(),
    }
}
