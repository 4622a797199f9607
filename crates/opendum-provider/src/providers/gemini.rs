use async_trait::async_trait;
use bytes::Bytes;
use opendum_protocol::canonical::{
    CanonicalEvent, CanonicalRequest, CanonicalRole, CanonicalToolChoice, FinishReason, TokenUsage,
};
use opendum_protocol::sse::SseFrame;
use opendum_translate::schema::sanitized;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::client::{HttpClient, UpstreamRequest};
use crate::providers::expires_at_from_expires_in;
use crate::{
    EventDecoder, OAuthResult, ProviderAdapter, ProviderError, ProviderKind, ProviderResult,
    UpstreamCredential,
};

const BASE_URL: &str = "https://cloudcode-pa.googleapis.com";
const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const CLIENT_ID: &str = "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const CLIENT_SECRET: &str = "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";
const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform https://www.googleapis.com/auth/userinfo.email https://www.googleapis.com/auth/userinfo.profile";
const USER_AGENT: &str = "GeminiCLI/0.1.5 (Windows; AMD64)";
const DEFAULT_REDIRECT_URI: &str = "http://localhost:8085/oauth2callback";

pub struct GeminiAdapter {
    http: HttpClient,
}

impl GeminiAdapter {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// The code-assist backend needs a project id; discover it once and
    /// persist it alongside the tokens.
    pub async fn discover_project_id(&self, access_token: &str) -> ProviderResult<Option<String>> {
        let payload = self
            .http
            .post_json_value(
                &format!("{BASE_URL}/v1internal:loadCodeAssist"),
                &[
                    ("authorization", format!("Bearer {access_token}")),
                    ("user-agent", USER_AGENT.to_string()),
                ],
                &serde_json::json!({
                    "metadata": { "pluginType": "GEMINI" },
                }),
            )
            .await?;
        let project = payload
            .get("cloudaicompanionProject")
            .and_then(|value| match value {
                JsonValue::String(text) => Some(text.clone()),
                JsonValue::Object(map) => map
                    .get("id")
                    .and_then(|id| id.as_str())
                    .map(|id| id.to_string()),
                _ => None,
            })
            .filter(|value| !value.trim().is_empty());
        Ok(project)
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
    id_token: Option<String>,
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
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
        let mut query = vec![
            ("response_type", "code".to_string()),
            ("client_id", CLIENT_ID.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("scope", OAUTH_SCOPE.to_string()),
            ("access_type", "offline".to_string()),
            ("prompt", "consent".to_string()),
            ("state", state.to_string()),
        ];
        if let Some(challenge) = pkce_challenge {
            query.push(("code_challenge", challenge.to_string()));
            query.push(("code_challenge_method", "S256".to_string()));
        }
        let qs = query
            .into_iter()
            .map(|(key, value)| format!("{key}={}", urlencoding::encode(&value)))
            .collect::<Vec<_>>()
            .join("&");
        Ok(format!("{AUTH_URL}?{qs}"))
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        pkce_verifier: Option<&str>,
    ) -> ProviderResult<OAuthResult> {
        let mut body = format!(
            "grant_type=authorization_code&code={}&redirect_uri={}&client_id={}&client_secret={}",
            urlencoding::encode(code),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(CLIENT_ID),
            urlencoding::encode(CLIENT_SECRET),
        );
        if let Some(verifier) = pkce_verifier {
            body.push_str("&code_verifier=");
            body.push_str(&urlencoding::encode(verifier));
        }
        let payload = self.http.post_form(TOKEN_URL, &[], body).await?;
        let mut result = parse_token_payload(payload)?;
        if let Ok(project_id) = self.discover_project_id(&result.access_token).await {
            result.project_id = project_id;
        }
        Ok(result)
    }

    async fn refresh_token(&self, refresh_token: &str) -> ProviderResult<OAuthResult> {
        let body = format!(
            "grant_type=refresh_token&refresh_token={}&client_id={}&client_secret={}",
            urlencoding::encode(refresh_token),
            urlencoding::encode(CLIENT_ID),
            urlencoding::encode(CLIENT_SECRET),
        );
        let payload = self.http.post_form(TOKEN_URL, &[], body).await?;
        let mut result = parse_token_payload(payload)?;
        // Google refreshes do not rotate the refresh token.
        if result.refresh_token.is_none() {
            result.refresh_token = Some(refresh_token.to_string());
        }
        Ok(result)
    }

    fn build_generate_request(
        &self,
        credential: &UpstreamCredential,
        request: &CanonicalRequest,
        model: &str,
    ) -> ProviderResult<UpstreamRequest> {
        let project_id = credential
            .project_id
            .as_deref()
            .ok_or(ProviderError::Other("missing project_id".to_string()))?;
        let wrapped = serde_json::json!({
            "model": model,
            "project": project_id,
            "user_prompt_id": uuid::Uuid::new_v4().simple().to_string(),
            "request": build_generate_body(request),
        });
        let body =
            serde_json::to_vec(&wrapped).map_err(|err| ProviderError::Other(err.to_string()))?;
        Ok(UpstreamRequest::post_json(
            format!("{BASE_URL}/v1internal:streamGenerateContent?alt=sse"),
            Bytes::from(body),
        )
        .header(
            "authorization",
            format!("Bearer {}", credential.access_token),
        )
        .header("user-agent", USER_AGENT)
        .header("accept", "text/event-stream")
        .streaming())
    }

    fn new_decoder(&self) -> Box<dyn EventDecoder> {
        Box::new(GeminiDecoder::default())
    }
}

fn parse_token_payload(payload: JsonValue) -> ProviderResult<OAuthResult> {
    let token: TokenResponse =
        serde_json::from_value(payload).map_err(|err| ProviderError::Other(err.to_string()))?;
    let email = token.id_token.as_deref().and_then(email_from_id_token);
    Ok(OAuthResult {
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        expires_at: expires_at_from_expires_in(token.expires_in),
        email,
        account_id: None,
        api_key: None,
        project_id: None,
        tier: None,
    })
}

fn email_from_id_token(id_token: &str) -> Option<String> {
    use base64::Engine;
    let payload = id_token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let value = serde_json::from_slice::<JsonValue>(&bytes).ok()?;
    value
        .get("email")
        .and_then(|email| email.as_str())
        .map(|email| email.to_string())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiContent {
    role: &'static str,
    parts: Vec<JsonValue>,
}

fn build_generate_body(request: &CanonicalRequest) -> JsonValue {
    let mut contents: Vec<GeminiContent> = Vec::new();
    for message in &request.messages {
        match message.role {
            CanonicalRole::System | CanonicalRole::User => {
                if !message.content.is_empty() {
                    contents.push(GeminiContent {
                        role: "user",
                        parts: vec![serde_json::json!({ "text": message.content })],
                    });
                }
            }
            CanonicalRole::Assistant => {
                let mut parts = Vec::new();
                if !message.content.is_empty() {
                    parts.push(serde_json::json!({ "text": message.content }));
                }
                for call in &message.tool_calls {
                    parts.push(serde_json::json!({
                        "functionCall": {
                            "name": call.name,
                            "args": serde_json::from_str::<JsonValue>(&call.arguments)
                                .unwrap_or_else(|_| serde_json::json!({})),
                        }
                    }));
                }
                if !parts.is_empty() {
                    contents.push(GeminiContent {
                        role: "model",
                        parts,
                    });
                }
            }
            CanonicalRole::Tool => {
                let name = message
                    .tool_call_id
                    .as_deref()
                    .and_then(|call_id| function_name_for_call(request, call_id))
                    .unwrap_or("tool");
                contents.push(GeminiContent {
                    role: "user",
                    parts: vec![serde_json::json!({
                        "functionResponse": {
                            "name": name,
                            "response": { "result": message.content },
                        }
                    })],
                });
            }
        }
    }

    let mut body = serde_json::json!({ "contents": contents });

    if let Some(system) = request.system.as_deref() {
        body["systemInstruction"] = serde_json::json!({
            "parts": [{ "text": system }],
        });
    }

    if !request.tools.is_empty() {
        let declarations: Vec<JsonValue> = request
            .tools
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": sanitized(tool.parameters.clone()),
                })
            })
            .collect();
        body["tools"] = serde_json::json!([{ "functionDeclarations": declarations }]);
    }

    if let Some(choice) = request.tool_choice.as_ref() {
        let config = match choice {
            CanonicalToolChoice::Auto => serde_json::json!({ "mode": "AUTO" }),
            CanonicalToolChoice::Required => serde_json::json!({ "mode": "ANY" }),
            CanonicalToolChoice::None => serde_json::json!({ "mode": "NONE" }),
            CanonicalToolChoice::Function { name } => serde_json::json!({
                "mode": "ANY",
                "allowedFunctionNames": [name],
            }),
        };
        body["toolConfig"] = serde_json::json!({ "functionCallingConfig": config });
    }

    let mut generation = serde_json::Map::new();
    if let Some(max_tokens) = request.max_tokens {
        generation.insert("maxOutputTokens".to_string(), max_tokens.into());
    }
    if let Some(temperature) = request.temperature {
        generation.insert("temperature".to_string(), temperature.into());
    }
    if let Some(top_p) = request.top_p {
        generation.insert("topP".to_string(), top_p.into());
    }
    if !request.stop.is_empty() {
        generation.insert(
            "stopSequences".to_string(),
            serde_json::json!(request.stop),
        );
    }
    if request.include_reasoning {
        generation.insert(
            "thinkingConfig".to_string(),
            serde_json::json!({ "includeThoughts": true }),
        );
    }
    if !generation.is_empty() {
        body["generationConfig"] = JsonValue::Object(generation);
    }

    body
}

fn function_name_for_call<'a>(request: &'a CanonicalRequest, call_id: &str) -> Option<&'a str> {
    request
        .messages
        .iter()
        .flat_map(|message| message.tool_calls.iter())
        .find(|call| call.id == call_id)
        .map(|call| call.name.as_str())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiCandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: Option<bool>,
    #[serde(default)]
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: JsonValue,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    thoughts_token_count: u32,
}

/// Gemini SSE → canonical events. Function calls arrive whole, so each
/// becomes a synthetic start/args/end triple with a generated call id.
#[derive(Default)]
struct GeminiDecoder {
    next_call: u32,
    saw_tool_call: bool,
    usage: Option<GeminiUsage>,
    finished: bool,
}

impl EventDecoder for GeminiDecoder {
    fn on_frame(&mut self, frame: &SseFrame) -> Vec<CanonicalEvent> {
        if frame.data.is_empty() || frame.is_done_marker() {
            return Vec::new();
        }
        // The code-assist backend wraps each chunk as {"response": ...}.
        let value = match serde_json::from_str::<JsonValue>(&frame.data) {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "skipping unparseable stream payload");
                return Vec::new();
            }
        };
        let inner = value.get("response").cloned().unwrap_or(value);
        let chunk: GeminiChunk = match serde_json::from_value(inner) {
            Ok(chunk) => chunk,
            Err(err) => {
                debug!(error = %err, "skipping unrecognized stream chunk");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        if let Some(usage) = chunk.usage_metadata {
            self.usage = Some(usage);
        }
        for candidate in chunk.candidates {
            if let Some(content) = candidate.content {
                for part in content.parts {
                    if let Some(text) = part.text {
                        if text.is_empty() {
                            continue;
                        }
                        if part.thought.unwrap_or(false) {
                            out.push(CanonicalEvent::Reasoning { text });
                        } else {
                            out.push(CanonicalEvent::Text { text });
                        }
                    } else if let Some(call) = part.function_call {
                        let id = format!("call_g{}", self.next_call);
                        self.next_call += 1;
                        self.saw_tool_call = true;
                        out.push(CanonicalEvent::ToolCallStart {
                            id: id.clone(),
                            name: call.name,
                        });
                        out.push(CanonicalEvent::ToolCallArgsDelta {
                            id: id.clone(),
                            fragment: call.args.to_string(),
                        });
                        out.push(CanonicalEvent::ToolCallEnd { id });
                    }
                }
            }
            if let Some(reason) = candidate.finish_reason {
                out.extend(self.finish_events(&reason));
            }
        }
        out
    }

    fn on_end(&mut self) -> Vec<CanonicalEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finish_events("STOP")
    }
}

impl GeminiDecoder {
    fn finish_events(&mut self, reason: &str) -> Vec<CanonicalEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let reason = match reason {
            _ if self.saw_tool_call => FinishReason::ToolUse,
            "MAX_TOKENS" => FinishReason::MaxTokens,
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => {
                FinishReason::ContentFilter
            }
            _ => FinishReason::Stop,
        };
        let mut out = vec![CanonicalEvent::Finish { reason }];
        if let Some(usage) = self.usage {
            out.push(CanonicalEvent::Usage {
                usage: TokenUsage {
                    input_tokens: usage.prompt_token_count,
                    output_tokens: usage.candidates_token_count + usage.thoughts_token_count,
                },
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendum_protocol::canonical::CanonicalMessage;

    fn data_frame(data: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn decodes_wrapped_text_chunks() {
        let mut decoder = GeminiDecoder::default();
        let events = decoder.on_frame(&data_frame(
            r#"{"response":{"candidates":[{"content":{"parts":[{"text":"hello"}]}}]}}"#,
        ));
        assert_eq!(
            events,
            vec![CanonicalEvent::Text {
                text: "hello".to_string()
            }]
        );
    }

    #[test]
    fn function_calls_become_synthetic_triples() {
        let mut decoder = GeminiDecoder::default();
        let events = decoder.on_frame(&data_frame(
            r#"{"response":{"candidates":[{"content":{"parts":[{"functionCall":{"name":"f","args":{"a":1}}}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2}}}"#,
        ));
        assert_eq!(events.len(), 5);
        assert!(matches!(
            &events[0],
            CanonicalEvent::ToolCallStart { id, name } if id == "call_g0" && name == "f"
        ));
        assert!(matches!(
            &events[3],
            CanonicalEvent::Finish {
                reason: FinishReason::ToolUse
            }
        ));
        assert!(matches!(
            &events[4],
            CanonicalEvent::Usage { usage } if usage.input_tokens == 4 && usage.output_tokens == 2
        ));
    }

    #[test]
    fn eof_without_marker_still_finishes_once() {
        let mut decoder = GeminiDecoder::default();
        decoder.on_frame(&data_frame(
            r#"{"candidates":[{"content":{"parts":[{"text":"x"}]}}]}"#,
        ));
        let end = decoder.on_end();
        assert!(matches!(end[0], CanonicalEvent::Finish { .. }));
        assert!(decoder.on_end().is_empty());
    }

    #[test]
    fn thoughts_map_to_reasoning() {
        let mut decoder = GeminiDecoder::default();
        let events = decoder.on_frame(&data_frame(
            r#"{"candidates":[{"content":{"parts":[{"text":"pondering","thought":true}]}}]}"#,
        ));
        assert_eq!(
            events,
            vec![CanonicalEvent::Reasoning {
                text: "pondering".to_string()
            }]
        );
    }

    #[test]
    fn tool_results_resolve_their_function_name() {
        let request = CanonicalRequest {
            model: "gemini-x".to_string(),
            messages: vec![
                CanonicalMessage {
                    role: CanonicalRole::Assistant,
                    content: String::new(),
                    tool_calls: vec![opendum_protocol::canonical::CanonicalToolCall {
                        id: "call_g0".to_string(),
                        name: "lookup".to_string(),
                        arguments: "{}".to_string(),
                    }],
                    tool_call_id: None,
                },
                CanonicalMessage {
                    role: CanonicalRole::Tool,
                    content: "42".to_string(),
                    tool_calls: Vec::new(),
                    tool_call_id: Some("call_g0".to_string()),
                },
            ],
            ..CanonicalRequest::default()
        };
        let body = build_generate_body(&request);
        let name = body["contents"][1]["parts"][0]["functionResponse"]["name"]
            .as_str()
            .unwrap();
        assert_eq!(name, "lookup");
    }
}
