use std::time::SystemTime;

use tokio::time::Instant;
use tproxy_common::{ModelClass, TranscodeMode};
use tproxy_transform::TokenRewrite;

use crate::classify::RequestContext;
use crate::events::{RequestEvent, StreamOutcome};

pub const ERROR_SNIPPET_CHARS: usize = 256;

/// Truncates upstream error text to a short, log-safe excerpt.
pub fn error_snippet(text: &str) -> String {
    let text = text.trim();
    let mut out: String = text.chars().take(ERROR_SNIPPET_CHARS).collect();
    if out.len() < text.len() {
        out.push('…');
    }
    out
}

/// Accumulates request metadata until the exchange is over.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub trace_id: String,
    pub started_at: Instant,
    pub method: String,
    pub path: String,
    pub model: Option<String>,
    pub class: Option<ModelClass>,
    pub status: u16,
    pub attempts: u32,
    pub token_rewrites: Vec<TokenRewrite>,
    pub truncated_messages: usize,
    pub upstream_error: Option<String>,
    pub transcode: Option<TranscodeMode>,
}

impl RequestRecord {
    pub fn new(trace_id: String, method: String, path: String, started_at: Instant) -> Self {
        Self {
            trace_id,
            started_at,
            method,
            path,
            model: None,
            class: None,
            status: 0,
            attempts: 0,
            token_rewrites: Vec::new(),
            truncated_messages: 0,
            upstream_error: None,
            transcode: None,
        }
    }

    pub fn with_context(mut self, ctx: &RequestContext) -> Self {
        self.model = ctx.model.clone();
        self.class = ctx.class;
        self.token_rewrites = ctx.rewrite.token_rewrites.clone();
        self.truncated_messages = ctx.rewrite.truncated_messages;
        self
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn finish(self, stream_outcome: Option<StreamOutcome>, response_bytes: u64) -> RequestEvent {
        RequestEvent {
            duration_ms: self.elapsed_ms(),
            trace_id: self.trace_id,
            at: SystemTime::now(),
            method: self.method,
            path: self.path,
            model: self.model,
            class: self.class,
            status: self.status,
            attempts: self.attempts,
            token_rewrites: self.token_rewrites,
            truncated_messages: self.truncated_messages,
            upstream_error: self.upstream_error,
            stream_outcome,
            response_bytes,
            transcode: self.transcode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_is_capped() {
        let long = "x".repeat(1000);
        let snippet = error_snippet(&long);
        assert_eq!(snippet.chars().count(), ERROR_SNIPPET_CHARS + 1);
        assert_eq!(error_snippet("  short  "), "short");
    }
}
