use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use opendum_protocol::canonical::{CanonicalEvent, CanonicalRequest, FinishReason, TokenUsage};
use opendum_protocol::responses::response::OutputItem;
use opendum_protocol::responses::stream::{ResponsesStreamEvent, ResponsesStreamFrame};
use opendum_protocol::sse::SseFrame;
use opendum_translate::egress::canonical_to_responses;
use opendum_translate::normalize_call_id;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::client::{HttpClient, UpstreamRequest};
use crate::pkce::generate_pkce;
use crate::providers::expires_at_from_expires_in;
use crate::{
    DeviceCodeStart, DevicePoll, EventDecoder, OAuthResult, ProviderAdapter, ProviderError,
    ProviderKind, ProviderResult, UpstreamCredential,
};

const BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
const ISSUER: &str = "https://auth.openai.com";
const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
const OAUTH_SCOPE: &str = "openid profile email offline_access";
const ORIGINATOR: &str = "codex_cli_rs";
const DEFAULT_REDIRECT_URI: &str = "http://localhost:1455/auth/callback";

pub struct CodexAdapter {
    http: HttpClient,
}

impl CodexAdapter {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    async fn token_request(&self, form_body: String) -> ProviderResult<OAuthResult> {
        let payload = self
            .http
            .post_form(&format!("{ISSUER}/oauth/token"), &[], form_body)
            .await?;
        parse_token_payload(payload)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DeviceUserCode {
    device_auth_id: String,
    #[serde(alias = "usercode")]
    user_code: String,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DevicePollPayload {
    authorization_code: String,
    code_verifier: String,
}

#[async_trait]
impl ProviderAdapter for CodexAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Codex
    }

    fn default_redirect_uri(&self) -> &'static str {
        DEFAULT_REDIRECT_URI
    }

    fn auth_url(
        &self,
        state: &str,
        pkce_challenge: Option<&str>,
        redirect_uri: &str,
    ) -> ProviderResult<String> {
        let challenge =
            pkce_challenge.ok_or(ProviderError::Other("pkce challenge required".to_string()))?;
        let query = [
            ("response_type", "code"),
            ("client_id", CLIENT_ID),
            ("redirect_uri", redirect_uri),
            ("scope", OAUTH_SCOPE),
            ("code_challenge", challenge),
            ("code_challenge_method", "S256"),
            ("id_token_add_organizations", "true"),
            ("state", state),
            ("originator", ORIGINATOR),
        ]
        .iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&");
        Ok(format!("{ISSUER}/oauth/authorize?{query}"))
    }

    async fn initiate_device_code(&self) -> ProviderResult<DeviceCodeStart> {
        let payload = self
            .http
            .post_json_value(
                &format!("{ISSUER}/api/accounts/deviceauth/usercode"),
                &[],
                &serde_json::json!({ "client_id": CLIENT_ID }),
            )
            .await?;
        let response: DeviceUserCode =
            serde_json::from_value(payload).map_err(|err| ProviderError::Other(err.to_string()))?;
        Ok(DeviceCodeStart {
            device_auth_id: response.device_auth_id,
            user_code: response.user_code,
            verification_url: format!("{ISSUER}/codex/device"),
            expires_in_secs: response.expires_in.unwrap_or(600),
            poll_interval_secs: response.interval.unwrap_or(5).max(1),
            pkce_verifier: generate_pkce().code_verifier,
        })
    }

    async fn poll_device_code(
        &self,
        device_auth_id: &str,
        user_code: &str,
        _pkce_verifier: &str,
    ) -> ProviderResult<DevicePoll> {
        let result = self
            .http
            .post_json_value(
                &format!("{ISSUER}/api/accounts/deviceauth/token"),
                &[],
                &serde_json::json!({
                    "device_auth_id": device_auth_id,
                    "user_code": user_code,
                }),
            )
            .await;
        let payload = match result {
            Ok(payload) => payload,
            // The endpoint answers 403/404 until the user finishes.
            Err(ProviderError::Http { status, .. }) if status == 403 || status == 404 => {
                return Ok(DevicePoll::Pending);
            }
            Err(ProviderError::Http { status, body }) if status == 400 => {
                return Ok(DevicePoll::Denied(format!("{status}: {body}")));
            }
            Err(err) => return Err(err),
        };
        let poll: DevicePollPayload =
            serde_json::from_value(payload).map_err(|err| ProviderError::Other(err.to_string()))?;
        // The poll hands back its own authorization code + verifier pair.
        let redirect_uri = format!("{ISSUER}/deviceauth/callback");
        let tokens = self
            .exchange_code(
                &poll.authorization_code,
                &redirect_uri,
                Some(&poll.code_verifier),
            )
            .await?;
        Ok(DevicePoll::Authorized(Box::new(tokens)))
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        pkce_verifier: Option<&str>,
    ) -> ProviderResult<OAuthResult> {
        let verifier =
            pkce_verifier.ok_or(ProviderError::Other("pkce verifier required".to_string()))?;
        let body = format!(
            "grant_type=authorization_code&code={}&redirect_uri={}&client_id={}&code_verifier={}",
            urlencoding::encode(code),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(CLIENT_ID),
            urlencoding::encode(verifier),
        );
        self.token_request(body).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> ProviderResult<OAuthResult> {
        let body = format!(
            "grant_type=refresh_token&refresh_token={}&client_id={}",
            urlencoding::encode(refresh_token),
            urlencoding::encode(CLIENT_ID),
        );
        self.token_request(body).await
    }

    fn build_generate_request(
        &self,
        credential: &UpstreamCredential,
        request: &CanonicalRequest,
        model: &str,
    ) -> ProviderResult<UpstreamRequest> {
        let mut wire = canonical_to_responses(request, model);
        // The backend rejects persisted responses and token caps.
        wire.store = Some(false);
        wire.max_output_tokens = None;
        wire.provider_account_id = None;
        let body =
            serde_json::to_vec(&wire).map_err(|err| ProviderError::Other(err.to_string()))?;

        let mut req =
            UpstreamRequest::post_json(format!("{BASE_URL}/responses"), Bytes::from(body))
                .header(
                    "authorization",
                    format!("Bearer {}", credential.access_token),
                )
                .header("accept", "text/event-stream")
                .header("originator", ORIGINATOR)
                .header("session_id", uuid::Uuid::new_v4().to_string())
                .streaming();
        if let Some(account_id) = credential.account_id.as_deref() {
            req = req.header("chatgpt-account-id", account_id);
        }
        Ok(req)
    }

    fn new_decoder(&self) -> Box<dyn EventDecoder> {
        Box::new(CodexDecoder::default())
    }
}

fn parse_token_payload(payload: JsonValue) -> ProviderResult<OAuthResult> {
    let token: TokenResponse =
        serde_json::from_value(payload).map_err(|err| ProviderError::Other(err.to_string()))?;
    let claims = token
        .id_token
        .as_deref()
        .map(parse_id_token_claims)
        .unwrap_or_default();
    Ok(OAuthResult {
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        expires_at: expires_at_from_expires_in(token.expires_in),
        email: claims.email,
        account_id: claims.account_id,
        api_key: None,
        project_id: None,
        tier: claims.plan,
    })
}

#[derive(Debug, Default)]
struct IdTokenClaims {
    email: Option<String>,
    account_id: Option<String>,
    plan: Option<String>,
}

/// Reads claims out of the id token without verifying the signature; the
/// token was just handed to us by the issuer over TLS.
fn parse_id_token_claims(id_token: &str) -> IdTokenClaims {
    let mut claims = IdTokenClaims::default();
    let Some(payload_b64) = id_token.split('.').nth(1) else {
        return claims;
    };
    let Ok(payload_bytes) = URL_SAFE_NO_PAD.decode(payload_b64) else {
        return claims;
    };
    let Ok(payload) = serde_json::from_slice::<JsonValue>(&payload_bytes) else {
        return claims;
    };

    claims.email = payload
        .get("email")
        .and_then(|value| value.as_str())
        .or_else(|| {
            payload
                .get("https://api.openai.com/profile")
                .and_then(|profile| profile.get("email"))
                .and_then(|value| value.as_str())
        })
        .map(|value| value.to_string());
    if let Some(auth) = payload.get("https://api.openai.com/auth") {
        claims.account_id = auth
            .get("chatgpt_account_id")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string());
        claims.plan = auth
            .get("chatgpt_plan_type")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string());
    }
    claims
}

/// Responses-API SSE → canonical events.
#[derive(Default)]
struct CodexDecoder {
    saw_tool_call: bool,
    finished: bool,
}

impl EventDecoder for CodexDecoder {
    fn on_frame(&mut self, frame: &SseFrame) -> Vec<CanonicalEvent> {
        if frame.data.is_empty() || frame.is_done_marker() {
            return Vec::new();
        }
        let event = match serde_json::from_str::<ResponsesStreamFrame>(&frame.data) {
            Ok(ResponsesStreamFrame::Known(event)) => event,
            Ok(ResponsesStreamFrame::Unknown(_)) => return Vec::new(),
            Err(err) => {
                debug!(error = %err, "skipping unparseable stream payload");
                return Vec::new();
            }
        };

        match event {
            ResponsesStreamEvent::OutputTextDelta { delta, .. } => {
                vec![CanonicalEvent::Text { text: delta }]
            }
            ResponsesStreamEvent::ReasoningSummaryTextDelta { delta, .. }
            | ResponsesStreamEvent::ReasoningTextDelta { delta, .. } => {
                vec![CanonicalEvent::Reasoning { text: delta }]
            }
            ResponsesStreamEvent::OutputItemAdded { item, .. } => match item {
                OutputItem::FunctionCall { call_id, name, .. } => {
                    self.saw_tool_call = true;
                    vec![CanonicalEvent::ToolCallStart {
                        id: normalize_call_id(&call_id),
                        name,
                    }]
                }
                _ => Vec::new(),
            },
            ResponsesStreamEvent::FunctionCallArgumentsDelta { item_id, delta, .. } => {
                match item_id {
                    Some(item_id) => vec![CanonicalEvent::ToolCallArgsDelta {
                        id: normalize_call_id(&item_id),
                        fragment: delta,
                    }],
                    None => Vec::new(),
                }
            }
            ResponsesStreamEvent::OutputItemDone { item, .. } => match item {
                OutputItem::FunctionCall { call_id, .. } => {
                    vec![CanonicalEvent::ToolCallEnd {
                        id: normalize_call_id(&call_id),
                    }]
                }
                _ => Vec::new(),
            },
            ResponsesStreamEvent::Completed { response }
            | ResponsesStreamEvent::Failed { response } => {
                if self.finished {
                    return Vec::new();
                }
                self.finished = true;
                let reason = if self.saw_tool_call {
                    FinishReason::ToolUse
                } else {
                    FinishReason::Stop
                };
                let mut out = vec![CanonicalEvent::Finish { reason }];
                if let Some(usage) = response.usage {
                    out.push(CanonicalEvent::Usage {
                        usage: TokenUsage {
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                        },
                    });
                }
                out
            }
            ResponsesStreamEvent::Created { .. }
            | ResponsesStreamEvent::InProgress { .. }
            | ResponsesStreamEvent::FunctionCallArgumentsDone { .. } => Vec::new(),
        }
    }

    fn on_end(&mut self) -> Vec<CanonicalEvent> {
        Vec::new()
    }
}
