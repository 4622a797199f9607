use async_trait::async_trait;
use bytes::Bytes;
use opendum_protocol::anthropic::response::StopReason;
use opendum_protocol::anthropic::stream::{
    MessagesStreamEvent, MessagesStreamFrame, StreamContentBlock, StreamContentDelta,
};
use opendum_protocol::canonical::{CanonicalEvent, CanonicalRequest, FinishReason, TokenUsage};
use opendum_protocol::sse::SseFrame;
use opendum_translate::egress::canonical_to_anthropic;
use serde::Deserialize;
use tracing::debug;

use crate::client::{HttpClient, UpstreamRequest};
use crate::providers::expires_at_from_expires_in;
use crate::{
    EventDecoder, OAuthResult, ProviderAdapter, ProviderError, ProviderKind, ProviderResult,
    UpstreamCredential,
};

const API_BASE: &str = "https://api.anthropic.com";
const AUTHORIZE_BASE: &str = "https://claude.ai";
const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const OAUTH_SCOPE: &str = "org:create_api_key user:profile user:inference";
const OAUTH_BETA: &str = "oauth-2025-04-20";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const USER_AGENT: &str = "claude-cli/1.0.83 (external, cli)";
const DEFAULT_REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";

pub struct ClaudeAdapter {
    http: HttpClient,
}

impl ClaudeAdapter {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    account: Option<TokenAccount>,
}

#[derive(Debug, Deserialize)]
struct TokenAccount {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    email_address: Option<String>,
}

#[async_trait]
impl ProviderAdapter for ClaudeAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
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
        let query = format!(
            "code=true&client_id={}&response_type=code&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
            urlencoding::encode(CLIENT_ID),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(OAUTH_SCOPE),
            urlencoding::encode(challenge),
            urlencoding::encode(state),
        );
        Ok(format!("{AUTHORIZE_BASE}/oauth/authorize?{query}"))
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        pkce_verifier: Option<&str>,
    ) -> ProviderResult<OAuthResult> {
        let verifier =
            pkce_verifier.ok_or(ProviderError::Other("pkce verifier required".to_string()))?;
        // Pasted codes sometimes carry the URL fragment along.
        let code = code.split(['#', '&']).next().unwrap_or(code);
        let body = format!(
            "grant_type=authorization_code&client_id={}&code={}&redirect_uri={}&code_verifier={}",
            urlencoding::encode(CLIENT_ID),
            urlencoding::encode(code),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(verifier),
        );
        let payload = self
            .http
            .post_form(
                &format!("{API_BASE}/v1/oauth/token"),
                &[
                    ("user-agent", USER_AGENT.to_string()),
                    ("accept", "application/json, text/plain, */*".to_string()),
                ],
                body,
            )
            .await?;
        parse_token_payload(payload)
    }

    async fn refresh_token(&self, refresh_token: &str) -> ProviderResult<OAuthResult> {
        let payload = self
            .http
            .post_json_value(
                &format!("{API_BASE}/v1/oauth/token"),
                &[
                    ("user-agent", USER_AGENT.to_string()),
                    ("accept", "application/json, text/plain, */*".to_string()),
                ],
                &serde_json::json!({
                    "grant_type": "refresh_token",
                    "client_id": CLIENT_ID,
                    "refresh_token": refresh_token,
                }),
            )
            .await?;
        parse_token_payload(payload)
    }

    fn build_generate_request(
        &self,
        credential: &UpstreamCredential,
        request: &CanonicalRequest,
        model: &str,
    ) -> ProviderResult<UpstreamRequest> {
        let wire = canonical_to_anthropic(request, model);
        let body =
            serde_json::to_vec(&wire).map_err(|err| ProviderError::Other(err.to_string()))?;
        Ok(
            UpstreamRequest::post_json(format!("{API_BASE}/v1/messages"), Bytes::from(body))
                .header(
                    "authorization",
                    format!("Bearer {}", credential.access_token),
                )
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("anthropic-beta", OAUTH_BETA)
                .header("user-agent", USER_AGENT)
                .header("accept", "text/event-stream")
                .streaming(),
        )
    }

    fn new_decoder(&self) -> Box<dyn EventDecoder> {
        Box::new(ClaudeDecoder::default())
    }
}

fn parse_token_payload(payload: serde_json::Value) -> ProviderResult<OAuthResult> {
    let token: TokenResponse =
        serde_json::from_value(payload).map_err(|err| ProviderError::Other(err.to_string()))?;
    let (account_id, email) = token
        .account
        .map(|account| (account.uuid, account.email_address))
        .unwrap_or((None, None));
    Ok(OAuthResult {
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        expires_at: expires_at_from_expires_in(token.expires_in),
        email,
        account_id,
        api_key: None,
        project_id: None,
        tier: None,
    })
}

/// Anthropic SSE → canonical events. Usage is split across
/// `message_start` (input) and `message_delta` (output); the decoder
/// joins them and emits one usage event alongside the finish signal.
#[derive(Default)]
struct ClaudeDecoder {
    input_tokens: u32,
    open_tool: Option<(u32, String)>,
}

impl EventDecoder for ClaudeDecoder {
    fn on_frame(&mut self, frame: &SseFrame) -> Vec<CanonicalEvent> {
        if frame.data.is_empty() || frame.is_done_marker() {
            return Vec::new();
        }
        let parsed = match serde_json::from_str::<MessagesStreamFrame>(&frame.data) {
            Ok(MessagesStreamFrame::Known(event)) => event,
            Ok(MessagesStreamFrame::Unknown(value)) => {
                debug!(event = ?frame.event, payload = %value, "skipping unrecognized stream event");
                return Vec::new();
            }
            Err(err) => {
                debug!(error = %err, "skipping unparseable stream payload");
                return Vec::new();
            }
        };

        match parsed {
            MessagesStreamEvent::MessageStart { message } => {
                self.input_tokens = message.usage.input_tokens;
                Vec::new()
            }
            MessagesStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                StreamContentBlock::Text { text } => {
                    if text.is_empty() {
                        Vec::new()
                    } else {
                        vec![CanonicalEvent::Text { text }]
                    }
                }
                StreamContentBlock::Thinking { thinking, .. } => {
                    if thinking.is_empty() {
                        Vec::new()
                    } else {
                        vec![CanonicalEvent::Reasoning { text: thinking }]
                    }
                }
                StreamContentBlock::ToolUse { id, name, .. } => {
                    self.open_tool = Some((index, id.clone()));
                    vec![CanonicalEvent::ToolCallStart { id, name }]
                }
            },
            MessagesStreamEvent::ContentBlockDelta { index, delta } => match delta {
                StreamContentDelta::TextDelta { text } => vec![CanonicalEvent::Text { text }],
                StreamContentDelta::ThinkingDelta { thinking } => {
                    vec![CanonicalEvent::Reasoning { text: thinking }]
                }
                StreamContentDelta::InputJsonDelta { partial_json } => {
                    match self.tool_id_for(index) {
                        Some(id) => vec![CanonicalEvent::ToolCallArgsDelta {
                            id,
                            fragment: partial_json,
                        }],
                        None => Vec::new(),
                    }
                }
                StreamContentDelta::SignatureDelta { .. } => Vec::new(),
            },
            MessagesStreamEvent::ContentBlockStop { index } => {
                match self.open_tool.take_if(|(open, _)| *open == index) {
                    Some((_, id)) => vec![CanonicalEvent::ToolCallEnd { id }],
                    None => Vec::new(),
                }
            }
            MessagesStreamEvent::MessageDelta { delta, usage } => {
                let mut out = Vec::new();
                if let Some(stop_reason) = delta.stop_reason {
                    out.push(CanonicalEvent::Finish {
                        reason: map_stop(stop_reason),
                    });
                }
                if let Some(usage) = usage {
                    let input = if usage.input_tokens > 0 {
                        usage.input_tokens
                    } else {
                        self.input_tokens
                    };
                    out.push(CanonicalEvent::Usage {
                        usage: TokenUsage {
                            input_tokens: input,
                            output_tokens: usage.output_tokens,
                        },
                    });
                }
                out
            }
            MessagesStreamEvent::MessageStop
            | MessagesStreamEvent::Ping
            | MessagesStreamEvent::Error { .. } => Vec::new(),
        }
    }

    fn on_end(&mut self) -> Vec<CanonicalEvent> {
        Vec::new()
    }
}

impl ClaudeDecoder {
    fn tool_id_for(&self, index: u32) -> Option<String> {
        self.open_tool
            .as_ref()
            .filter(|(open, _)| *open == index)
            .map(|(_, id)| id.clone())
    }
}

fn map_stop(reason: StopReason) -> FinishReason {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => FinishReason::Stop,
        StopReason::ToolUse => FinishReason::ToolUse,
        StopReason::MaxTokens => FinishReason::MaxTokens,
        StopReason::Refusal => FinishReason::ContentFilter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event: &str, data: &str) -> SseFrame {
        SseFrame {
            event: Some(event.to_string()),
            data: data.to_string(),
        }
    }

    #[test]
    fn decodes_text_and_tool_stream() {
        let mut decoder = ClaudeDecoder::default();
        let mut events = Vec::new();
        events.extend(decoder.on_frame(&frame(
            "message_start",
            r#"{"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","model":"claude-x","content":[],"usage":{"input_tokens":12,"output_tokens":0}}}"#,
        )));
        events.extend(decoder.on_frame(&frame(
            "content_block_start",
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
        )));
        events.extend(decoder.on_frame(&frame(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
        )));
        events.extend(decoder.on_frame(&frame(
            "content_block_stop",
            r#"{"type":"content_block_stop","index":0}"#,
        )));
        events.extend(decoder.on_frame(&frame(
            "content_block_start",
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"f","input":{}}}"#,
        )));
        events.extend(decoder.on_frame(&frame(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{}"}}"#,
        )));
        events.extend(decoder.on_frame(&frame(
            "content_block_stop",
            r#"{"type":"content_block_stop","index":1}"#,
        )));
        events.extend(decoder.on_frame(&frame(
            "message_delta",
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
        )));
        events.extend(decoder.on_frame(&frame("message_stop", r#"{"type":"message_stop"}"#)));

        assert_eq!(
            events,
            vec![
                CanonicalEvent::Text {
                    text: "hi".to_string()
                },
                CanonicalEvent::ToolCallStart {
                    id: "toolu_1".to_string(),
                    name: "f".to_string()
                },
                CanonicalEvent::ToolCallArgsDelta {
                    id: "toolu_1".to_string(),
                    fragment: "{}".to_string()
                },
                CanonicalEvent::ToolCallEnd {
                    id: "toolu_1".to_string()
                },
                CanonicalEvent::Finish {
                    reason: FinishReason::ToolUse
                },
                CanonicalEvent::Usage {
                    usage: TokenUsage {
                        input_tokens: 12,
                        output_tokens: 9
                    }
                },
            ]
        );
    }

    #[test]
    fn unparseable_payloads_are_skipped() {
        let mut decoder = ClaudeDecoder::default();
        assert!(decoder.on_frame(&frame("message_delta", "not json")).is_empty());
    }

    #[test]
    fn auth_url_carries_pkce_and_state() {
        let adapter = ClaudeAdapter::new(
            crate::client::HttpClient::new(crate::client::HttpClientConfig::default()).unwrap(),
        );
        let url = adapter
            .auth_url("st1", Some("challenge"), adapter.default_redirect_uri())
            .unwrap();
        assert!(url.starts_with("https://claude.ai/oauth/authorize?"));
        assert!(url.contains("code_challenge=challenge"));
        assert!(url.contains("state=st1"));
    }
}
