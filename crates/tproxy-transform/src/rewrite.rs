//! Request payload rewriting: output-token clamping and tool-output truncation.

use serde::Serialize;
use serde_json::Value;
use tproxy_common::TruncationConfig;

pub const TOKEN_LIMIT_FIELDS: [&str; 3] =
    ["max_tokens", "max_output_tokens", "max_completion_tokens"];

const TOOL_ROLES: [&str; 2] = ["tool", "function"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationPolicy {
    pub max_chars: usize,
    pub head_chars: usize,
    pub tail_chars: usize,
}

impl From<&TruncationConfig> for TruncationPolicy {
    fn from(value: &TruncationConfig) -> Self {
        Self {
            max_chars: value.max_chars,
            head_chars: value.head_chars,
            tail_chars: value.tail_chars,
        }
    }
}

impl TruncationPolicy {
    /// Head and tail spans, shrunk so together they never exceed the cap.
    fn spans(&self) -> (usize, usize) {
        let head = self.head_chars.min(self.max_chars);
        let tail = self.tail_chars.min(self.max_chars - head);
        (head, tail)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewritePolicy {
    /// Upper bound applied to every token-limit field; `None` disables clamping.
    pub token_cap: Option<u64>,
    /// `None` disables tool-output truncation.
    pub truncation: Option<TruncationPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenRewrite {
    pub field: &'static str,
    pub original: u64,
    pub rewritten: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RewriteReport {
    pub token_rewrites: Vec<TokenRewrite>,
    pub truncated_messages: usize,
    pub changed: bool,
}

/// Rewrites a decoded request body in place.
///
/// Only token-limit fields and tool/function message content are ever touched.
pub fn rewrite_request(body: &mut Value, policy: &RewritePolicy) -> RewriteReport {
    let mut report = RewriteReport::default();
    let Some(object) = body.as_object_mut() else {
        return report;
    };

    if let Some(cap) = policy.token_cap {
        for field in TOKEN_LIMIT_FIELDS {
            let Some(slot) = object.get_mut(field) else {
                continue;
            };
            let Some(original) = slot.as_u64() else {
                continue;
            };
            if original > cap {
                *slot = Value::from(cap);
                report.token_rewrites.push(TokenRewrite {
                    field,
                    original,
                    rewritten: cap,
                });
            }
        }
    }

    if let Some(truncation) = &policy.truncation {
        if let Some(messages) = object.get_mut("messages").and_then(Value::as_array_mut) {
            for message in messages.iter_mut() {
                if truncate_tool_message(message, truncation) {
                    report.truncated_messages += 1;
                }
            }
        }
    }

    report.changed = !report.token_rewrites.is_empty() || report.truncated_messages > 0;
    report
}

fn truncate_tool_message(message: &mut Value, policy: &TruncationPolicy) -> bool {
    let is_tool = message
        .get("role")
        .and_then(Value::as_str)
        .is_some_and(|role| TOOL_ROLES.contains(&role));
    if !is_tool {
        return false;
    }

    match message.get_mut("content") {
        Some(Value::String(text)) => match truncate_text(text, policy) {
            Some(truncated) => {
                *text = truncated;
                true
            }
            None => false,
        },
        Some(Value::Array(parts)) => {
            let mut touched = false;
            for part in parts.iter_mut() {
                let is_text = part.get("type").and_then(Value::as_str) == Some("text");
                if !is_text {
                    continue;
                }
                if let Some(Value::String(text)) = part.get_mut("text") {
                    if let Some(truncated) = truncate_text(text, policy) {
                        *text = truncated;
                        touched = true;
                    }
                }
            }
            touched
        }
        _ => false,
    }
}

/// Returns the truncated form of `text` when it exceeds the cap, counted in
/// characters.
pub fn truncate_text(text: &str, policy: &TruncationPolicy) -> Option<String> {
    let total = text.chars().count();
    if total <= policy.max_chars {
        return None;
    }

    let (head, tail) = policy.spans();
    let omitted = total - head - tail;

    let head_end = text
        .char_indices()
        .nth(head)
        .map(|(offset, _)| offset)
        .unwrap_or(text.len());
    let tail_start = if tail == 0 {
        text.len()
    } else {
        text.char_indices()
            .nth(total - tail)
            .map(|(offset, _)| offset)
            .unwrap_or(text.len())
    };

    let marker = omission_marker(omitted);
    let mut out = String::with_capacity(head_end + marker.len() + (text.len() - tail_start));
    out.push_str(&text[..head_end]);
    out.push_str(&marker);
    out.push_str(&text[tail_start..]);
    Some(out)
}

pub fn omission_marker(omitted: usize) -> String {
    format!("\n\n[... {omitted} characters omitted ...]\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy(max: usize, head: usize, tail: usize) -> TruncationPolicy {
        TruncationPolicy {
            max_chars: max,
            head_chars: head,
            tail_chars: tail,
        }
    }

    #[test]
    fn clamps_every_token_field_without_raising() {
        let mut body = json!({
            "model": "m",
            "max_tokens": 8000,
            "max_output_tokens": 100,
            "max_completion_tokens": 4096
        });
        let report = rewrite_request(
            &mut body,
            &RewritePolicy {
                token_cap: Some(2048),
                truncation: None,
            },
        );
        assert_eq!(body["max_tokens"], 2048);
        assert_eq!(body["max_output_tokens"], 100);
        assert_eq!(body["max_completion_tokens"], 2048);
        assert_eq!(report.token_rewrites.len(), 2);
        assert_eq!(
            report.token_rewrites[0],
            TokenRewrite {
                field: "max_tokens",
                original: 8000,
                rewritten: 2048
            }
        );
        assert!(report.changed);
    }

    #[test]
    fn negative_or_non_integer_limits_are_ignored() {
        let mut body = json!({"max_tokens": -5, "max_completion_tokens": "lots"});
        let before = body.clone();
        let report = rewrite_request(
            &mut body,
            &RewritePolicy {
                token_cap: Some(10),
                truncation: None,
            },
        );
        assert_eq!(body, before);
        assert!(!report.changed);
    }

    #[test]
    fn truncation_keeps_head_and_tail_verbatim() {
        let text: String = (0..1000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let out = truncate_text(&text, &policy(100, 40, 20)).unwrap();
        assert!(out.starts_with(&text[..40]));
        assert!(out.ends_with(&text[980..]));
        assert!(out.contains("[... 940 characters omitted ...]"));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let text = "é".repeat(50);
        assert!(truncate_text(&text, &policy(50, 10, 10)).is_none());
        let text = "é".repeat(51);
        let out = truncate_text(&text, &policy(50, 10, 10)).unwrap();
        assert!(out.starts_with(&"é".repeat(10)));
        assert!(out.ends_with(&"é".repeat(10)));
        assert!(out.contains("[... 31 characters omitted ...]"));
    }

    #[test]
    fn spans_never_exceed_cap() {
        let text = "x".repeat(30);
        let out = truncate_text(&text, &policy(10, 8, 8)).unwrap();
        assert!(out.starts_with("xxxxxxxx\n\n[... 20 characters omitted"));
        assert!(out.ends_with("...]\n\nxx"));
    }

    #[test]
    fn only_tool_messages_are_truncated() {
        let long = "y".repeat(50);
        let mut body = json!({
            "messages": [
                {"role": "user", "content": long},
                {"role": "tool", "content": long},
                {"role": "function", "content": [
                    {"type": "text", "text": long},
                    {"type": "image_url", "image_url": {"url": "x"}}
                ]},
                {"role": "assistant", "content": [{"type": "text", "text": long}]}
            ]
        });
        let report = rewrite_request(
            &mut body,
            &RewritePolicy {
                token_cap: None,
                truncation: Some(policy(20, 5, 5)),
            },
        );
        assert_eq!(report.truncated_messages, 2);
        assert_eq!(body["messages"][0]["content"], long.as_str());
        assert_eq!(body["messages"][3]["content"][0]["text"], long.as_str());
        let tool = body["messages"][1]["content"].as_str().unwrap();
        assert!(tool.starts_with("yyyyy\n\n[... 40 characters omitted"));
        let part = body["messages"][2]["content"][0]["text"].as_str().unwrap();
        assert!(part.ends_with("\n\nyyyyy"));
    }

    #[test]
    fn non_object_body_is_untouched() {
        let mut body = json!([1, 2, 3]);
        let report = rewrite_request(
            &mut body,
            &RewritePolicy {
                token_cap: Some(1),
                truncation: Some(policy(1, 0, 0)),
            },
        );
        assert_eq!(report, RewriteReport::default());
    }
}
