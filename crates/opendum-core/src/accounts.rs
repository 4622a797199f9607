use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use opendum_provider::pkce::{generate_pkce, generate_state};
use opendum_provider::{DevicePoll, OAuthResult, ProviderError, ProviderKind, ProviderRegistry};
use opendum_storage::{AccountRow, AccountStore, NewAccount, StorageError};
use serde::Serialize;
use tracing::info;

const PENDING_TTL: Duration = Duration::from_secs(600);

#[derive(Debug)]
enum PendingAuth {
    Redirect {
        provider: ProviderKind,
        pkce_verifier: String,
        redirect_uri: String,
        created_at: Instant,
    },
    Device {
        provider: ProviderKind,
        device_auth_id: String,
        user_code: String,
        pkce_verifier: String,
        created_at: Instant,
    },
}

impl PendingAuth {
    fn created_at(&self) -> Instant {
        match self {
            PendingAuth::Redirect { created_at, .. } | PendingAuth::Device { created_at, .. } => {
                *created_at
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OAuthStart {
    pub auth_url: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStart {
    pub state: String,
    pub user_code: String,
    pub verification_url: String,
    pub expires_in: u64,
    pub poll_interval: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum OnboardingError {
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),
    #[error("unknown or expired state")]
    UnknownState,
    #[error("authorization pending")]
    Pending,
    #[error("authorization denied: {0}")]
    Denied(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Drives the provider auth flows and turns completed exchanges into
/// provider-account rows. Pending states are in-process with a TTL.
pub struct AccountOnboarding {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn AccountStore>,
    pending: Mutex<HashMap<String, PendingAuth>>,
}

impl AccountOnboarding {
    pub fn new(registry: Arc<ProviderRegistry>, store: Arc<dyn AccountStore>) -> Self {
        Self {
            registry,
            store,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn oauth_start(
        &self,
        provider: &str,
        redirect_uri: Option<&str>,
    ) -> Result<OAuthStart, OnboardingError> {
        let (kind, adapter) = self.adapter(provider)?;
        let pkce = generate_pkce();
        let state = generate_state();
        let redirect_uri = redirect_uri
            .unwrap_or(adapter.default_redirect_uri())
            .to_string();
        let auth_url = adapter.auth_url(&state, Some(&pkce.code_challenge), &redirect_uri)?;
        self.insert_pending(
            state.clone(),
            PendingAuth::Redirect {
                provider: kind,
                pkce_verifier: pkce.code_verifier,
                redirect_uri,
                created_at: Instant::now(),
            },
        );
        Ok(OAuthStart { auth_url, state })
    }

    pub async fn oauth_callback(
        &self,
        user_id: &str,
        state: &str,
        code: &str,
    ) -> Result<AccountRow, OnboardingError> {
        let pending = self.take_pending(state)?;
        let PendingAuth::Redirect {
            provider,
            pkce_verifier,
            redirect_uri,
            ..
        } = pending
        else {
            return Err(OnboardingError::UnknownState);
        };
        let adapter = self
            .registry
            .get(provider)
            .ok_or_else(|| OnboardingError::UnknownProvider(provider.to_string()))?;
        let result = adapter
            .exchange_code(code, &redirect_uri, Some(&pkce_verifier))
            .await?;
        self.persist(user_id, provider, result).await
    }

    pub async fn device_start(&self, provider: &str) -> Result<DeviceStart, OnboardingError> {
        let (kind, adapter) = self.adapter(provider)?;
        let start = adapter.initiate_device_code().await?;
        let state = generate_state();
        self.insert_pending(
            state.clone(),
            PendingAuth::Device {
                provider: kind,
                device_auth_id: start.device_auth_id,
                user_code: start.user_code.clone(),
                pkce_verifier: start.pkce_verifier,
                created_at: Instant::now(),
            },
        );
        Ok(DeviceStart {
            state,
            user_code: start.user_code,
            verification_url: start.verification_url,
            expires_in: start.expires_in_secs,
            poll_interval: start.poll_interval_secs,
        })
    }

    pub async fn device_poll(
        &self,
        user_id: &str,
        state: &str,
    ) -> Result<AccountRow, OnboardingError> {
        let (provider, device_auth_id, user_code, pkce_verifier) = {
            let guard = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match guard.get(state) {
                Some(PendingAuth::Device {
                    provider,
                    device_auth_id,
                    user_code,
                    pkce_verifier,
                    ..
                }) => (
                    *provider,
                    device_auth_id.clone(),
                    user_code.clone(),
                    pkce_verifier.clone(),
                ),
                _ => return Err(OnboardingError::UnknownState),
            }
        };
        let adapter = self
            .registry
            .get(provider)
            .ok_or_else(|| OnboardingError::UnknownProvider(provider.to_string()))?;
        match adapter
            .poll_device_code(&device_auth_id, &user_code, &pkce_verifier)
            .await?
        {
            DevicePoll::Pending => Err(OnboardingError::Pending),
            DevicePoll::Denied(reason) => {
                self.take_pending(state).ok();
                Err(OnboardingError::Denied(reason))
            }
            DevicePoll::Authorized(result) => {
                self.take_pending(state).ok();
                self.persist(user_id, provider, *result).await
            }
        }
    }

    async fn persist(
        &self,
        user_id: &str,
        provider: ProviderKind,
        result: OAuthResult,
    ) -> Result<AccountRow, OnboardingError> {
        let name = result
            .email
            .clone()
            .unwrap_or_else(|| format!("{provider} account"));
        let account = self
            .store
            .upsert_account(NewAccount {
                user_id: user_id.to_string(),
                provider: provider.as_str().to_string(),
                name: Some(name),
                email: result.email,
                provider_account_id: result.account_id,
                access_token: result.access_token,
                refresh_token: result.refresh_token.unwrap_or_default(),
                api_key: result.api_key,
                project_id: result.project_id,
                tier: result.tier,
                expires_at: result.expires_at,
            })
            .await?;
        info!(account = %account.id, provider = %provider, "provider account linked");
        Ok(account)
    }

    fn adapter(
        &self,
        provider: &str,
    ) -> Result<(ProviderKind, Arc<dyn opendum_provider::ProviderAdapter>), OnboardingError> {
        let kind = ProviderKind::parse(provider)
            .ok_or_else(|| OnboardingError::UnknownProvider(provider.to_string()))?;
        let adapter = self
            .registry
            .get(kind)
            .ok_or_else(|| OnboardingError::UnknownProvider(provider.to_string()))?;
        Ok((kind, adapter))
    }

    fn insert_pending(&self, state: String, pending: PendingAuth) {
        let mut guard = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        guard.retain(|_, entry| now.duration_since(entry.created_at()) < PENDING_TTL);
        guard.insert(state, pending);
    }

    fn take_pending(&self, state: &str) -> Result<PendingAuth, OnboardingError> {
        let mut guard = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = guard.remove(state).ok_or(OnboardingError::UnknownState)?;
        if entry.created_at().elapsed() >= PENDING_TTL {
            return Err(OnboardingError::UnknownState);
        }
        Ok(entry)
    }
}
