pub mod client;
pub mod pkce;
pub mod providers;
pub mod refresh;
pub mod registry;

use async_trait::async_trait;
use opendum_protocol::canonical::{CanonicalEvent, CanonicalRequest};
use opendum_protocol::sse::SseFrame;
use time::OffsetDateTime;

pub use client::{HttpClient, UpstreamBody, UpstreamRequest, UpstreamResponse, UpstreamTransport};
pub use refresh::{CredentialError, CredentialService};
pub use registry::ProviderRegistry;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("credential expired")]
    CredentialExpired,
    #[error("{0} is not supported by this provider")]
    Unsupported(&'static str),
    #[error("{0}")]
    Other(String),
}

/// Closed set of upstream providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Claude,
    Codex,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::Codex => "codex",
            ProviderKind::Gemini => "gemini",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "claude" => Some(ProviderKind::Claude),
            "codex" => Some(ProviderKind::Codex),
            "gemini" => Some(ProviderKind::Gemini),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a completed OAuth or device-code exchange, and of every
/// token refresh.
#[derive(Debug, Clone)]
pub struct OAuthResult {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    pub email: Option<String>,
    pub account_id: Option<String>,
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    pub tier: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeviceCodeStart {
    pub device_auth_id: String,
    pub user_code: String,
    pub verification_url: String,
    pub expires_in_secs: u64,
    pub poll_interval_secs: u64,
    pub pkce_verifier: String,
}

#[derive(Debug)]
pub enum DevicePoll {
    Authorized(Box<OAuthResult>),
    Pending,
    Denied(String),
}

/// What a request needs to authenticate against the upstream. Opaque to
/// the orchestrator.
#[derive(Debug, Clone)]
pub struct UpstreamCredential {
    pub access_token: String,
    pub account_id: Option<String>,
    pub api_key: Option<String>,
    pub project_id: Option<String>,
}

/// Stateful native-SSE → canonical-event decoder, one per stream.
pub trait EventDecoder: Send {
    fn on_frame(&mut self, frame: &SseFrame) -> Vec<CanonicalEvent>;
    /// Flush at end of stream; decoders that buffer usage or finish
    /// signals emit them here when the upstream closed without a marker.
    fn on_end(&mut self) -> Vec<CanonicalEvent>;
}

/// One upstream LLM provider: auth flows, token refresh, request
/// encoding and stream decoding. Implementations are stateless; all
/// persistence goes through the credential service.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Callback the provider's app registration expects when the caller
    /// does not supply one.
    fn default_redirect_uri(&self) -> &'static str;

    /// Authorization-URL for redirect flows.
    fn auth_url(
        &self,
        state: &str,
        pkce_challenge: Option<&str>,
        redirect_uri: &str,
    ) -> ProviderResult<String>;

    async fn initiate_device_code(&self) -> ProviderResult<DeviceCodeStart> {
        Err(ProviderError::Unsupported("device code flow"))
    }

    async fn poll_device_code(
        &self,
        _device_auth_id: &str,
        _user_code: &str,
        _pkce_verifier: &str,
    ) -> ProviderResult<DevicePoll> {
        Err(ProviderError::Unsupported("device code flow"))
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        pkce_verifier: Option<&str>,
    ) -> ProviderResult<OAuthResult>;

    async fn refresh_token(&self, refresh_token: &str) -> ProviderResult<OAuthResult>;

    /// Projects the canonical request onto the provider's native wire
    /// form. The upstream call always streams.
    fn build_generate_request(
        &self,
        credential: &UpstreamCredential,
        request: &CanonicalRequest,
        model: &str,
    ) -> ProviderResult<UpstreamRequest>;

    fn new_decoder(&self) -> Box<dyn EventDecoder>;
}
