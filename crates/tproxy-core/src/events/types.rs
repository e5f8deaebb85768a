use std::time::SystemTime;

use serde::Serialize;
use tproxy_common::{ModelClass, TranscodeMode};
use tproxy_transform::TokenRewrite;

#[derive(Debug, Clone, Serialize)]
pub enum Event {
    Request(RequestEvent),
    Operational(OperationalEvent),
}

/// One finished client exchange. Carries metadata only, never bodies.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEvent {
    pub trace_id: String,
    pub at: SystemTime,
    pub method: String,
    pub path: String,
    pub model: Option<String>,
    pub class: Option<ModelClass>,
    pub status: u16,
    pub duration_ms: u64,
    pub attempts: u32,
    pub token_rewrites: Vec<TokenRewrite>,
    pub truncated_messages: usize,
    /// Short, capped excerpt of the last upstream error.
    pub upstream_error: Option<String>,
    pub stream_outcome: Option<StreamOutcome>,
    pub response_bytes: u64,
    pub transcode: Option<TranscodeMode>,
}

/// How the body pump ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamOutcome {
    Completed,
    ClientDisconnected,
    TimedOut,
    UpstreamError,
    TranscoderFault,
}

impl StreamOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamOutcome::Completed => "completed",
            StreamOutcome::ClientDisconnected => "client_disconnected",
            StreamOutcome::TimedOut => "timed_out",
            StreamOutcome::UpstreamError => "upstream_error",
            StreamOutcome::TranscoderFault => "transcoder_fault",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum OperationalEvent {
    CooldownStarted(CooldownStartedEvent),
    GovernorReset(GovernorResetEvent),
    PendingAborted(PendingAbortedEvent),
}

#[derive(Debug, Clone, Serialize)]
pub struct CooldownStartedEvent {
    pub at: SystemTime,
    pub failures: u32,
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GovernorResetEvent {
    pub at: SystemTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingAbortedEvent {
    pub at: SystemTime,
}
