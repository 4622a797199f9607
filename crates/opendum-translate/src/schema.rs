use serde_json::Value as JsonValue;

/// Keywords some upstreams reject inside tool parameter schemas.
const DROPPED_KEYWORDS: [&str; 2] = ["additionalProperties", "strict"];

/// Strips unsupported JSON-schema keywords at every nesting level,
/// including `properties.*` and `items`.
pub fn sanitize_tool_schema(schema: &mut JsonValue) {
    match schema {
        JsonValue::Object(map) => {
            for keyword in DROPPED_KEYWORDS {
                map.remove(keyword);
            }
            for value in map.values_mut() {
                sanitize_tool_schema(value);
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                sanitize_tool_schema(item);
            }
        }
        _ => {}
    }
}

pub fn sanitized(mut schema: JsonValue) -> JsonValue {
    sanitize_tool_schema(&mut schema);
    schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_keywords_recursively() {
        let mut schema = json!({
            "type": "object",
            "additionalProperties": false,
            "strict": true,
            "properties": {
                "outer": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "inner": { "type": "string", "strict": true }
                    }
                },
                "list": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "properties": { "x": { "type": "number" } }
                    }
                }
            }
        });
        sanitize_tool_schema(&mut schema);
        let text = schema.to_string();
        assert!(!text.contains("additionalProperties"));
        assert!(!text.contains("strict"));
        assert_eq!(schema["properties"]["outer"]["properties"]["inner"]["type"], "string");
    }

    #[test]
    fn leaves_scalars_untouched() {
        let mut schema = json!("string");
        sanitize_tool_schema(&mut schema);
        assert_eq!(schema, json!("string"));
    }
}
