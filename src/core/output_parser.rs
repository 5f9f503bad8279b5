//! Structured tool output parsing.
//!
//! Tools run by build steps may print display messages as
//! `JSON{"message":"...","colour":"..."}` on standard output. Everything
//! else is plain text. Parsing never fails: anything that does not decode
//! is reported as not structured and the caller shows the raw line.

use serde_json::{Map, Value};

/// Prefix marking a structured line
pub const SENTINEL: &str = "JSON";

/// Outcome of parsing one line of standard output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedLine {
    /// Whether the line was a structured message
    pub structured: bool,

    /// Decoded `(text, colour)` pairs in order; empty colour means none
    pub messages: Vec<(String, String)>,
}

impl ParsedLine {
    fn plain() -> Self {
        Self::default()
    }
}

/// Try to decode a structured output line
///
/// The payload after the sentinel must start with a JSON object. Escaped
/// newlines that arrive double-escaped (`\\n`) are normalized first.
/// Fragments trailing the object (`{"message":"a"}{b}`) come back as extra
/// plain messages without colour.
pub fn try_parse(line: &str) -> ParsedLine {
    // Needs at least the sentinel plus "{}"
    if line.len() < SENTINEL.len() + 2 || !line.starts_with(SENTINEL) {
        return ParsedLine::plain();
    }

    let payload = line[SENTINEL.len()..].trim().replace("\\\\n", "\\n");
    if !payload.starts_with('{') {
        return ParsedLine::plain();
    }

    let mut values = serde_json::Deserializer::from_str(&payload).into_iter::<Value>();
    let object = match values.next() {
        Some(Ok(Value::Object(object))) => object,
        _ => return ParsedLine::plain(),
    };
    let rest = &payload[values.byte_offset()..];

    let mut messages = vec![(field(&object, "message"), field(&object, "colour"))];
    messages.extend(
        rest.split('}')
            .map(|fragment| fragment.trim().trim_start_matches('{').trim())
            .filter(|fragment| !fragment.is_empty())
            .map(|fragment| (fragment.to_string(), String::new())),
    );

    ParsedLine {
        structured: true,
        messages,
    }
}

fn field(object: &Map<String, Value>, key: &str) -> String {
    match object.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(text: &str, colour: &str) -> (String, String) {
        (text.to_string(), colour.to_string())
    }

    #[test]
    fn test_single_structured_message() {
        let parsed = try_parse(r#"JSON{"message":"hello","colour":"red"}"#);
        assert!(parsed.structured);
        assert_eq!(parsed.messages, vec![pair("hello", "red")]);
    }

    #[test]
    fn test_trailing_fragment_becomes_plain_message() {
        let parsed = try_parse(r#"JSON{"message":"hi"}{extra}"#);
        assert!(parsed.structured);
        assert_eq!(parsed.messages, vec![pair("hi", ""), pair("extra", "")]);
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        let parsed = try_parse(r#"JSON{"other":1}"#);
        assert!(parsed.structured);
        assert_eq!(parsed.messages, vec![pair("", "")]);
    }

    #[test]
    fn test_plain_lines() {
        for line in ["", "JSON", "JSON{", "hello world", "Signing build 42", "JSONnot json"] {
            let parsed = try_parse(line);
            assert!(!parsed.structured, "{:?} should be plain", line);
            assert!(parsed.messages.is_empty());
        }
    }

    #[test]
    fn test_malformed_payloads_never_structured() {
        let cases = [
            r#"JSON{"message":"hel"#,
            r#"JSON{"message":}"#,
            r#"JSON{message:"hi"}"#,
            r#"JSON{"message":"hi""#,
            "JSON{{{{",
            "JSON}{",
        ];
        for line in cases {
            assert!(!try_parse(line).structured, "{:?} should be plain", line);
        }
    }

    #[test]
    fn test_double_escaped_newlines_are_normalized() {
        let parsed = try_parse(r#"JSON{"message":"line one\\nline two","colour":"green"}"#);
        assert!(parsed.structured);
        assert_eq!(parsed.messages, vec![pair("line one\nline two", "green")]);
    }

    #[test]
    fn test_non_string_message_is_rendered() {
        let parsed = try_parse(r#"JSON{"message":42,"colour":null}"#);
        assert_eq!(parsed.messages, vec![pair("42", "")]);
    }

    #[test]
    fn test_multiple_trailing_fragments() {
        let parsed = try_parse(r#"JSON{"message":"a","colour":"blue"}{b}{c}"#);
        assert_eq!(
            parsed.messages,
            vec![pair("a", "blue"), pair("b", ""), pair("c", "")]
        );
    }
}
