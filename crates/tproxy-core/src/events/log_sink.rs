use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use super::{Event, EventSink, OperationalEvent};

/// Renders events as diagnostic log lines while diagnostics are switched on.
///
/// Request lines carry rewrite and outcome metadata only; prompt and tool
/// content are never part of an event.
pub struct LogEventSink {
    enabled: Arc<AtomicBool>,
}

impl LogEventSink {
    pub fn new(enabled: Arc<AtomicBool>) -> Self {
        Self { enabled }
    }
}

impl EventSink for LogEventSink {
    fn write(&self, event: &Event) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        match event {
            Event::Request(request) => {
                let token_rewrites = request
                    .token_rewrites
                    .iter()
                    .map(|rewrite| {
                        format!("{}:{}->{}", rewrite.field, rewrite.original, rewrite.rewritten)
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                info!(
                    event = "diagnostic_request",
                    trace_id = %request.trace_id,
                    method = %request.method,
                    path = %request.path,
                    model = ?request.model,
                    class = ?request.class,
                    status = request.status,
                    duration_ms = request.duration_ms,
                    attempts = request.attempts,
                    token_rewrites = %token_rewrites,
                    truncated_messages = request.truncated_messages,
                    upstream_error = ?request.upstream_error,
                    stream_outcome = ?request.stream_outcome.map(|outcome| outcome.as_str()),
                    response_bytes = request.response_bytes
                );
            }
            Event::Operational(OperationalEvent::CooldownStarted(cooldown)) => {
                warn!(
                    event = "diagnostic_cooldown",
                    failures = cooldown.failures,
                    cooldown_ms = cooldown.cooldown_ms
                );
            }
            Event::Operational(OperationalEvent::GovernorReset(_)) => {
                info!(event = "diagnostic_governor_reset");
            }
            Event::Operational(OperationalEvent::PendingAborted(_)) => {
                info!(event = "diagnostic_pending_aborted");
            }
        }
    }
}
