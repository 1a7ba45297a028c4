//! The request runtime: admission, monitoring, streaming, prompt and
//! history assembly, tool dispatch, and the reason–act loop itself.

pub mod compact;
pub mod emitter;
pub mod engine;
pub mod history;
pub mod limiter;
pub mod memory;
pub mod monitor;
pub mod parser;
pub mod prompt;
pub mod stream_bus;
pub mod tools;

use std::sync::OnceLock;

use regex::Regex;

fn data_url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"data:image/[a-zA-Z0-9+.\-]+;base64,[A-Za-z0-9+/=\r\n]+")
            .unwrap_or_else(|e| panic!("invalid data-url pattern: {e}"))
    })
}

/// Replace embedded base64 image data URLs with a short placeholder so
/// logged payloads stay readable and bounded.
pub(crate) fn replace_data_urls(text: &str) -> String {
    if !text.contains("data:image/") {
        return text.to_string();
    }
    data_url_pattern().replace_all(text, "[image]").into_owned()
}

/// Prepare an event payload for the monitor: strip image data URLs and
/// enforce the size cap. Oversized payloads collapse to a truncated
/// string preview.
pub(crate) fn sanitize_payload(data: &serde_json::Value, max_chars: usize) -> serde_json::Value {
    let rendered = serde_json::to_string(data).unwrap_or_default();
    let cleaned = replace_data_urls(&rendered);
    if cleaned.len() <= max_chars {
        return serde_json::from_str(&cleaned).unwrap_or(serde_json::Value::String(cleaned));
    }
    let preview = truncate_str(&cleaned, max_chars);
    serde_json::Value::String(preview)
}

/// Byte-bounded truncation that never splits a UTF-8 char.
pub(crate) fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_urls_replaced() {
        let text = format!("see data:image/png;base64,{}", "A".repeat(100));
        let cleaned = replace_data_urls(&text);
        assert_eq!(cleaned, "see [image]");
        assert_eq!(replace_data_urls("plain"), "plain");
    }

    #[test]
    fn sanitize_keeps_small_payloads_structured() {
        let payload = serde_json::json!({"a": 1});
        assert_eq!(sanitize_payload(&payload, 1000), payload);
    }

    #[test]
    fn sanitize_truncates_large_payloads() {
        let payload = serde_json::json!({"blob": "x".repeat(500)});
        let sanitized = sanitize_payload(&payload, 40);
        let text = sanitized.as_str().unwrap();
        assert!(text.len() <= 44);
        assert!(text.ends_with("..."));
    }

    #[test]
    fn truncate_respects_char_boundary() {
        let s = "héllo";
        // byte 2 lands inside the two-byte é
        assert_eq!(truncate_str(s, 2), "h...");
        assert_eq!(truncate_str("abc", 10), "abc");
    }
}
