//! JSON support for the WebSocket application protocol (§6 "JSON over
//! text frames"). Delegates to `serde_json` the way the rest of the pack
//! reaches for it for equivalent wire-format concerns, rather than
//! hand-rolling a parser for what amounts to flat objects of strings and
//! numbers.

pub type JsonValue = serde_json::Value;
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Parses a single JSON object. Anything that isn't a JSON object at the
/// top level (an array, a bare string, malformed input) is an error.
pub fn parse_object(input: &str) -> Result<JsonObject, String> {
    match serde_json::from_str::<serde_json::Value>(input) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err("expected a JSON object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// Escapes `s` for embedding inside a JSON string literal (without the
/// surrounding quotes serde_json would add).
pub fn escape(s: &str) -> String {
    let quoted = serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string());
    quoted[1..quoted.len() - 1].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_auth_message() {
        let obj = parse_object(r#"{"type":"auth","sessionid":"abc123"}"#).unwrap();
        assert_eq!(obj.get("type").unwrap().as_str(), Some("auth"));
        assert_eq!(obj.get("sessionid").unwrap().as_str(), Some("abc123"));
    }

    #[test]
    fn parses_chat_message_with_number() {
        let obj = parse_object(
            r#"{"type":"chat","subtype":"room_msg","from":"alice","room":"lobby","content":"hi","ts":1}"#,
        )
        .unwrap();
        assert_eq!(obj.get("subtype").unwrap().as_str(), Some("room_msg"));
        assert_eq!(obj.get("ts").unwrap().as_f64(), Some(1.0));
    }

    #[test]
    fn rejects_malformed_object() {
        assert!(parse_object("not json").is_err());
        assert!(parse_object(r#"{"type":"auth""#).is_err());
        assert!(parse_object("[1,2,3]").is_err());
    }

    #[test]
    fn escape_quotes_and_backslashes() {
        assert_eq!(escape("a\"b\\c"), "a\\\"b\\\\c");
    }
}
