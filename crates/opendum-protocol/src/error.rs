use serde::{Deserialize, Serialize};

/// Caller-facing error taxonomy. Every upstream or internal failure is
/// mapped onto one of these before anything reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthenticationError,
    InvalidRequestError,
    ConfigurationError,
    RateLimitError,
    ApiError,
    OverloadedError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthenticationError => "authentication_error",
            ErrorKind::InvalidRequestError => "invalid_request_error",
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::RateLimitError => "rate_limit_error",
            ErrorKind::ApiError => "api_error",
            ErrorKind::OverloadedError => "overloaded_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub r#type: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            r#type: kind,
            message: message.into(),
            param: None,
            code: None,
            retry_after: None,
            retry_after_ms: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retry_after_ms(mut self, retry_after_ms: u64) -> Self {
        self.retry_after = Some(retry_after_ms.div_ceil(1000));
        self.retry_after_ms = Some(retry_after_ms);
        self
    }
}

/// `{ "error": { ... } }` as used by the Chat and Responses dialects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail::new(kind, message),
        }
    }
}

/// `{ "type": "error", "error": { "type", "message" } }` as used by the
/// Anthropic dialect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicErrorEnvelope {
    #[serde(rename = "type")]
    pub r#type: String,
    pub error: AnthropicErrorBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicErrorBody {
    #[serde(rename = "type")]
    pub r#type: String,
    pub message: String,
}

impl AnthropicErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        // The Anthropic surface reports saturation as overloaded_error
        // where the other dialects use configuration_error.
        let kind = match kind {
            ErrorKind::ConfigurationError => ErrorKind::OverloadedError,
            other => other,
        };
        Self {
            r#type: "error".to_string(),
            error: AnthropicErrorBody {
                r#type: kind.as_str().to_string(),
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_bare_fields_only() {
        let env = ErrorEnvelope::new(ErrorKind::ApiError, "upstream failure");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["error"]["type"], "api_error");
        assert_eq!(json["error"]["message"], "upstream failure");
        assert!(json["error"].get("code").is_none());
    }

    #[test]
    fn retry_after_is_carried_in_both_units() {
        let env = ErrorEnvelope {
            error: ErrorDetail::new(ErrorKind::RateLimitError, "cooling down")
                .with_retry_after_ms(120_000),
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["error"]["retry_after_ms"], 120_000);
        assert_eq!(json["error"]["retry_after"], 120);
    }

    #[test]
    fn anthropic_envelope_rewrites_saturation() {
        let env = AnthropicErrorEnvelope::new(ErrorKind::ConfigurationError, "no accounts");
        assert_eq!(env.error.r#type, "overloaded_error");
        assert_eq!(env.r#type, "error");
    }
}
