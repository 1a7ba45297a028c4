//! Tool-call extraction from free-form model output.
//!
//! Recognition order: closed `<tool_call>`/`<tool>` tags, then open tags
//! without a closer, then a bare JSON payload. The balanced-JSON scanner
//! respects string literals and escapes, so prose around the block and
//! trailing garbage after an unclosed tag both parse.

use std::sync::OnceLock;

use regex::Regex;

use relay_domain::chat::ToolCall;

fn closed_tag_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(tool_call|tool)\b[^>]*>(.*?)</(tool_call|tool)\s*>")
            .unwrap_or_else(|e| panic!("invalid closed-tag pattern: {e}"))
    })
}

fn open_tag_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)<(tool_call|tool)\b[^>]*>")
            .unwrap_or_else(|e| panic!("invalid open-tag pattern: {e}"))
    })
}

fn close_tag_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)</(tool_call|tool)\s*>")
            .unwrap_or_else(|e| panic!("invalid close-tag pattern: {e}"))
    })
}

/// Parse every tool call in `text`, in order of appearance.
pub fn parse(text: &str) -> Vec<ToolCall> {
    if text.is_empty() {
        return Vec::new();
    }
    let calls = parse_closed_tags(text);
    if !calls.is_empty() {
        return calls;
    }
    let calls = parse_open_tags(text);
    if !calls.is_empty() {
        return calls;
    }
    parse_payload(text)
}

/// Remove every tool-call block (closed or dangling) from model output.
pub fn strip_tool_calls(content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }
    let stripped = closed_tag_pattern().replace_all(content, "");
    let stripped = open_tag_pattern().replace_all(&stripped, "");
    let stripped = close_tag_pattern().replace_all(&stripped, "");
    stripped.trim().to_string()
}

fn parse_closed_tags(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    for captures in closed_tag_pattern().captures_iter(text) {
        if let Some(payload) = captures.get(2) {
            calls.extend(parse_payload(payload.as_str().trim()));
        }
    }
    calls
}

fn parse_open_tags(text: &str) -> Vec<ToolCall> {
    let matches: Vec<_> = open_tag_pattern().find_iter(text).collect();
    if matches.is_empty() {
        return Vec::new();
    }
    let mut calls = Vec::new();
    for (index, m) in matches.iter().enumerate() {
        let start = m.end();
        let end = matches
            .get(index + 1)
            .map(|next| next.start())
            .unwrap_or(text.len());
        let payload = text[start..end].trim();
        if payload.is_empty() {
            continue;
        }
        calls.extend(parse_payload(payload));
    }
    calls
}

fn parse_payload(payload: &str) -> Vec<ToolCall> {
    let parsed = serde_json::from_str::<serde_json::Value>(payload)
        .ok()
        .or_else(|| extract_json(payload));
    normalize_calls(parsed)
}

/// Scan for the first balanced JSON object or array in `payload`.
fn extract_json(payload: &str) -> Option<serde_json::Value> {
    let bytes = payload.as_bytes();
    for (index, &byte) in bytes.iter().enumerate() {
        if byte != b'{' && byte != b'[' {
            continue;
        }
        if let Some(end) = find_json_end(bytes, index) {
            if let Ok(value) = serde_json::from_str(&payload[index..end]) {
                return Some(value);
            }
        }
    }
    None
}

/// Walk a brace/bracket stack from `start`, honoring string literals and
/// escapes. Returns the exclusive end index of the balanced region.
fn find_json_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escape = false;
    for (index, &byte) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escape {
                escape = false;
            } else if byte == b'\\' {
                escape = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => stack.push(byte),
            b'}' | b']' => {
                let Some(open) = stack.pop() else {
                    return None;
                };
                let matches = (open == b'{' && byte == b'}') || (open == b'[' && byte == b']');
                if !matches {
                    return None;
                }
                if stack.is_empty() {
                    return Some(index + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn normalize_calls(payload: Option<serde_json::Value>) -> Vec<ToolCall> {
    match payload {
        Some(serde_json::Value::Object(map)) => {
            normalize_call(serde_json::Value::Object(map)).into_iter().collect()
        }
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter(|item| item.is_object())
            .filter_map(normalize_call)
            .collect(),
        _ => Vec::new(),
    }
}

/// Require a `name`; coerce `arguments` into an object. String arguments
/// are JSON-parsed when possible, otherwise wrapped as `{raw: …}`.
fn normalize_call(value: serde_json::Value) -> Option<ToolCall> {
    let map = value.as_object()?;
    let name = map.get("name")?.as_str()?.trim().to_string();
    if name.is_empty() {
        return None;
    }
    let arguments = match map.get("arguments") {
        None | Some(serde_json::Value::Null) => serde_json::json!({}),
        Some(serde_json::Value::String(raw)) => serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::json!({ "raw": raw })),
        Some(other) => other.clone(),
    };
    Some(ToolCall { name, arguments })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_tool_call_tag() {
        let calls = parse(r#"<tool_call>{"name":"foo","arguments":{"a":1}}</tool_call>"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "foo");
        assert_eq!(calls[0].arguments["a"], 1);
    }

    #[test]
    fn closed_tool_tag() {
        let calls = parse(r#"<tool>{"name":"bar","arguments":{"b":2}}</tool>"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "bar");
        assert_eq!(calls[0].arguments["b"], 2);
    }

    #[test]
    fn case_insensitive_tags_with_attributes() {
        let calls = parse(r#"<TOOL_CALL id="1">{"name":"x","arguments":{}}</TOOL_CALL>"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "x");
    }

    #[test]
    fn unclosed_tag_with_trailing_text() {
        let calls = parse(r#"<tool_call>{"name":"baz","arguments":{"c":3}} trailing"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "baz");
        assert_eq!(calls[0].arguments["c"], 3);
    }

    #[test]
    fn arguments_as_json_string() {
        let calls = parse(r#"<tool>{"name":"foo","arguments":"{\"a\":1}"}</tool>"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["a"], 1);
    }

    #[test]
    fn arguments_as_opaque_string_wrapped() {
        let calls = parse(r#"<tool>{"name":"foo","arguments":"not json"}</tool>"#);
        assert_eq!(calls[0].arguments["raw"], "not json");
    }

    #[test]
    fn list_payload_emits_each_call() {
        let calls = parse(
            r#"<tool_call>[{"name":"one","arguments":{"a":1}},{"name":"two","arguments":{"b":2}}]</tool_call>"#,
        );
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "one");
        assert_eq!(calls[1].name, "two");
    }

    #[test]
    fn missing_name_dropped() {
        let calls = parse(r#"<tool_call>{"arguments":{"a":1}}</tool_call>"#);
        assert!(calls.is_empty());
    }

    #[test]
    fn bare_payload_embedded_in_prose() {
        let calls = parse(r#"I will call {"name":"read","arguments":{"path":"a.txt"}} now"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read");
    }

    #[test]
    fn braces_inside_string_literals() {
        let calls = parse(
            r#"<tool_call>{"name":"write","arguments":{"content":"fn main() { let x = \"}\"; }"}}</tool_call>"#,
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].arguments["content"],
            "fn main() { let x = \"}\"; }"
        );
    }

    #[test]
    fn plain_text_yields_nothing() {
        assert!(parse("just a normal answer with no calls").is_empty());
        assert!(parse("").is_empty());
    }

    #[test]
    fn multiple_open_tags_split_payloads() {
        let calls = parse(
            "<tool_call>{\"name\":\"a\",\"arguments\":{}}\n<tool_call>{\"name\":\"b\",\"arguments\":{}}",
        );
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "a");
        assert_eq!(calls[1].name, "b");
    }

    #[test]
    fn strip_removes_blocks_and_dangling_tags() {
        let content = "before <tool_call>{\"name\":\"x\",\"arguments\":{}}</tool_call> after";
        assert_eq!(strip_tool_calls(content), "before  after".trim());
        assert_eq!(strip_tool_calls("open <tool_call>{\"a\":1}"), "open {\"a\":1}");
        assert_eq!(strip_tool_calls("stray </tool> end"), "stray  end".trim());
    }

    #[test]
    fn reserialized_call_reparses_identically() {
        let original = parse(r#"<tool_call>{"name":"foo","arguments":{"a":[1,2],"b":"x"}}</tool_call>"#);
        assert_eq!(original.len(), 1);
        let reserialized = format!(
            "<tool_call>{}</tool_call>",
            serde_json::to_string(&original[0]).unwrap()
        );
        let reparsed = parse(&reserialized);
        assert_eq!(reparsed, original);
    }
}
