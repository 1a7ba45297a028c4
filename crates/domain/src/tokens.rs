//! Heuristic token estimation — 4 UTF-8 bytes ≈ 1 token, with a fixed
//! charge for embedded images so base64 payloads don't distort budgets.
//!
//! The estimator is deliberately tokenizer-free: compaction and trimming
//! only need a stable upper-bound-ish signal, not exact counts.

use std::sync::OnceLock;

use regex::Regex;

use crate::chat::{ContentPart, Message, MessageContent};

const APPROX_BYTES_PER_TOKEN: usize = 4;
/// Structural overhead charged per message.
const MESSAGE_TOKEN_OVERHEAD: u64 = 4;
/// Flat charge per embedded or attached image.
pub const IMAGE_TOKEN_ESTIMATE: u64 = 256;

const DEFAULT_TRUNCATION_SUFFIX: &str = "...(truncated)";

fn data_url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"data:image/[a-zA-Z0-9+.\-]+;base64,[A-Za-z0-9+/=\r\n]+")
            .unwrap_or_else(|e| panic!("invalid data-url pattern: {e}"))
    })
}

/// Rough token count for a text.
pub fn approx_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(APPROX_BYTES_PER_TOKEN) as u64
}

fn estimate_text_tokens(text: &str) -> u64 {
    if text.starts_with("data:image/") {
        return IMAGE_TOKEN_ESTIMATE;
    }
    if text.contains("data:image/") {
        let pattern = data_url_pattern();
        let image_count = pattern.find_iter(text).count() as u64;
        let stripped = pattern.replace_all(text, "[image]");
        return approx_tokens(&stripped) + image_count * IMAGE_TOKEN_ESTIMATE;
    }
    approx_tokens(text)
}

fn estimate_content_tokens(content: &MessageContent) -> u64 {
    match content {
        MessageContent::Text(text) => estimate_text_tokens(text),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => estimate_text_tokens(text),
                ContentPart::ImageUrl { .. } => IMAGE_TOKEN_ESTIMATE,
            })
            .sum(),
    }
}

/// Estimate the context cost of one message: content + reasoning trace +
/// per-message overhead.
pub fn estimate_message(message: &Message) -> u64 {
    let mut total = estimate_content_tokens(&message.content);
    if let Some(reasoning) = &message.reasoning_content {
        total += approx_tokens(reasoning);
    }
    total + MESSAGE_TOKEN_OVERHEAD
}

/// Estimate the total context cost of a message list.
pub fn estimate_messages(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message).sum()
}

/// Trim text to a token budget, preserving the prefix and appending a
/// truncation suffix. A budget at or below the suffix cost yields a
/// char-truncated suffix.
pub fn trim_text_to_tokens(text: &str, max_tokens: u64, suffix: Option<&str>) -> String {
    let suffix = suffix.unwrap_or(DEFAULT_TRUNCATION_SUFFIX);
    if text.is_empty() {
        return String::new();
    }
    if max_tokens == 0 {
        return suffix.to_string();
    }
    if approx_tokens(text) <= max_tokens {
        return text.to_string();
    }
    let suffix_tokens = approx_tokens(suffix);
    if max_tokens <= suffix_tokens {
        let max_chars = (max_tokens as usize * APPROX_BYTES_PER_TOKEN).max(1);
        return truncate_at_boundary(suffix, max_chars).to_string();
    }
    let max_chars = (max_tokens as usize * APPROX_BYTES_PER_TOKEN).saturating_sub(suffix.len());
    let trimmed = truncate_at_boundary(text, max_chars);
    format!("{trimmed}{suffix}")
}

/// Keep the most recent messages within a token budget. The last message
/// is always retained, even when it alone exceeds the budget.
pub fn trim_messages_to_budget(messages: &[Message], max_tokens: u64) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }
    if max_tokens == 0 {
        return vec![messages[messages.len() - 1].clone()];
    }

    let mut selected: Vec<Message> = Vec::new();
    let mut remaining = max_tokens;
    for message in messages.iter().rev() {
        let cost = estimate_message(message);
        if cost <= remaining {
            selected.push(message.clone());
            remaining -= cost;
            continue;
        }
        if selected.is_empty() {
            selected.push(message.clone());
        }
        break;
    }
    selected.reverse();
    selected
}

/// Slice at a char boundary at or below `max_bytes`.
fn truncate_at_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ImageUrl;

    #[test]
    fn approx_tokens_rounds_up() {
        assert_eq!(approx_tokens(""), 0);
        assert_eq!(approx_tokens("abc"), 1);
        assert_eq!(approx_tokens("abcd"), 1);
        assert_eq!(approx_tokens("abcde"), 2);
    }

    #[test]
    fn data_url_counts_as_fixed_image_charge() {
        let url = format!("data:image/png;base64,{}", "A".repeat(40_000));
        assert_eq!(estimate_text_tokens(&url), IMAGE_TOKEN_ESTIMATE);
    }

    #[test]
    fn embedded_data_url_is_replaced_not_counted() {
        let text = format!("look at data:image/png;base64,{} please", "B".repeat(8_000));
        let tokens = estimate_text_tokens(&text);
        // placeholder text + one image charge; far below the raw base64 cost
        assert!(tokens < IMAGE_TOKEN_ESTIMATE + 20);
        assert!(tokens > IMAGE_TOKEN_ESTIMATE);
    }

    #[test]
    fn message_overhead_and_reasoning_counted() {
        let mut msg = Message::assistant("abcd");
        assert_eq!(estimate_message(&msg), 1 + 4);
        msg.reasoning_content = Some("abcdefgh".into());
        assert_eq!(estimate_message(&msg), 1 + 2 + 4);
    }

    #[test]
    fn multipart_counts_text_and_images() {
        let msg = Message {
            role: crate::chat::Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "abcd".into(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: "data:image/png;base64,xyz".into(),
                    },
                },
            ]),
            reasoning_content: None,
        };
        assert_eq!(estimate_message(&msg), 1 + IMAGE_TOKEN_ESTIMATE + 4);
    }

    #[test]
    fn trim_text_keeps_prefix_and_appends_suffix() {
        let text = "x".repeat(400);
        let trimmed = trim_text_to_tokens(&text, 10, None);
        assert!(trimmed.ends_with(DEFAULT_TRUNCATION_SUFFIX));
        assert!(approx_tokens(&trimmed) <= 10);
        assert!(trimmed.starts_with("xxx"));
    }

    #[test]
    fn trim_text_below_suffix_budget() {
        let text = "y".repeat(400);
        let trimmed = trim_text_to_tokens(&text, 2, None);
        assert_eq!(trimmed, &DEFAULT_TRUNCATION_SUFFIX[..8]);
    }

    #[test]
    fn trim_text_noop_when_within_budget() {
        assert_eq!(trim_text_to_tokens("short", 100, None), "short");
    }

    #[test]
    fn trim_messages_keeps_most_recent() {
        let messages: Vec<Message> = (0..10)
            .map(|i| Message::user("m".repeat(40) + &i.to_string()))
            .collect();
        let kept = trim_messages_to_budget(&messages, 50);
        assert!(!kept.is_empty());
        assert!(kept.len() < 10);
        // most recent survives
        assert_eq!(
            kept.last().unwrap().content.all_text(),
            messages.last().unwrap().content.all_text()
        );
        assert!(estimate_messages(&kept) <= 50);
    }

    #[test]
    fn trim_messages_always_keeps_last() {
        let messages = vec![Message::user("z".repeat(4000))];
        let kept = trim_messages_to_budget(&messages, 1);
        assert_eq!(kept.len(), 1);
    }
}
