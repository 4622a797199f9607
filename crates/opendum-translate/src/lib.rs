pub mod aggregate;
pub mod egress;
pub mod emit;
pub mod ingest;
pub mod schema;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid request shape: {0}")]
    InvalidShape(String),
}

/// Provider-side ids arrive as `fc_X` or `fc-X`; callers and upstreams
/// agree on `call_X`.
pub fn normalize_call_id(id: &str) -> String {
    if let Some(rest) = id.strip_prefix("fc_").or_else(|| id.strip_prefix("fc-")) {
        return format!("call_{rest}");
    }
    id.to_string()
}

#[cfg(test)]
mod tests {
    use super::normalize_call_id;

    #[test]
    fn call_id_normalization() {
        assert_eq!(normalize_call_id("fc_123"), "call_123");
        assert_eq!(normalize_call_id("fc-123"), "call_123");
        assert_eq!(normalize_call_id("call_123"), "call_123");
        assert_eq!(normalize_call_id("other"), "other");
    }
}
