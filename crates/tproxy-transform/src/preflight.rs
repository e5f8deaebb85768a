//! First-event validation of a streamed chat response before the proxy
//! commits its status line to the client.

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tproxy_protocol::{SseFrame, SseParser};

pub const DEFAULT_PREFLIGHT_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PreflightFailure {
    #[error("upstream stream opened with an empty event")]
    EmptyPayload,
    #[error("upstream stream ended before producing any output")]
    DoneBeforeOutput,
    #[error("upstream stream opened without choices")]
    NoChoices,
    #[error("upstream closed the stream before the first event")]
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightVerdict {
    /// Need more bytes.
    Pending,
    Valid,
    Invalid(PreflightFailure),
}

#[derive(Debug)]
pub struct PreflightValidator {
    parser: SseParser,
    prefix: BytesMut,
    limit: usize,
    verdict: PreflightVerdict,
}

impl Default for PreflightValidator {
    fn default() -> Self {
        Self::new(DEFAULT_PREFLIGHT_LIMIT)
    }
}

impl PreflightValidator {
    pub fn new(limit: usize) -> Self {
        Self {
            parser: SseParser::new(),
            prefix: BytesMut::new(),
            limit,
            verdict: PreflightVerdict::Pending,
        }
    }

    pub fn verdict(&self) -> PreflightVerdict {
        self.verdict
    }

    /// Feeds upstream bytes. Once a verdict is reached, further bytes are
    /// still appended to the prefix so nothing is lost on replay.
    pub fn push(&mut self, chunk: &[u8]) -> PreflightVerdict {
        self.prefix.extend_from_slice(chunk);
        if self.verdict != PreflightVerdict::Pending {
            return self.verdict;
        }

        for frame in self.parser.push(chunk) {
            if let Some(verdict) = judge_frame(&frame) {
                self.verdict = verdict;
                return verdict;
            }
        }

        // Permissive: a first event this large is not an empty stream.
        if self.prefix.len() >= self.limit {
            self.verdict = PreflightVerdict::Valid;
        }
        self.verdict
    }

    /// Upstream reached EOF.
    pub fn finish(&mut self) -> PreflightVerdict {
        if self.verdict != PreflightVerdict::Pending {
            return self.verdict;
        }
        self.verdict = self
            .parser
            .finish()
            .and_then(|frame| judge_frame(&frame))
            .unwrap_or(PreflightVerdict::Invalid(PreflightFailure::EndOfStream));
        self.verdict
    }

    /// Everything received so far, to be replayed ahead of the remaining body.
    pub fn into_prefix(self) -> Bytes {
        self.prefix.freeze()
    }
}

fn judge_frame(frame: &SseFrame) -> Option<PreflightVerdict> {
    // Comment and event-name-only frames say nothing about the payload.
    let data = frame.data.as_deref()?;
    let data = data.trim();
    if data.is_empty() {
        return Some(PreflightVerdict::Invalid(PreflightFailure::EmptyPayload));
    }
    if frame.is_done() {
        return Some(PreflightVerdict::Invalid(PreflightFailure::DoneBeforeOutput));
    }
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return Some(PreflightVerdict::Valid);
    };
    let has_choices = value
        .get("choices")
        .and_then(Value::as_array)
        .is_some_and(|choices| !choices.is_empty());
    Some(if has_choices {
        PreflightVerdict::Valid
    } else {
        PreflightVerdict::Invalid(PreflightFailure::NoChoices)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_choices_is_invalid() {
        let mut validator = PreflightValidator::default();
        assert_eq!(
            validator.push(b"data: {\"choices\":[]}\n\n"),
            PreflightVerdict::Invalid(PreflightFailure::NoChoices)
        );
    }

    #[test]
    fn populated_choices_is_valid_and_prefix_is_kept() {
        let mut validator = PreflightValidator::default();
        assert_eq!(
            validator.push(b": ping\n\ndata: {\"choices\":[{\"de"),
            PreflightVerdict::Pending
        );
        assert_eq!(
            validator.push(b"lta\":{}}]}\n\ndata: more\n\n"),
            PreflightVerdict::Valid
        );
        assert_eq!(
            &validator.into_prefix()[..],
            b": ping\n\ndata: {\"choices\":[{\"delta\":{}}]}\n\ndata: more\n\n"
        );
    }

    #[test]
    fn done_first_is_invalid() {
        let mut validator = PreflightValidator::default();
        assert_eq!(
            validator.push(b"data: [DONE]\n\n"),
            PreflightVerdict::Invalid(PreflightFailure::DoneBeforeOutput)
        );
    }

    #[test]
    fn non_json_payload_is_valid() {
        let mut validator = PreflightValidator::default();
        assert_eq!(validator.push(b"data: hello\n\n"), PreflightVerdict::Valid);
    }

    #[test]
    fn error_object_is_invalid() {
        let mut validator = PreflightValidator::default();
        assert_eq!(
            validator.push(b"data: {\"error\":{\"message\":\"boom\"}}\n\n"),
            PreflightVerdict::Invalid(PreflightFailure::NoChoices)
        );
    }

    #[test]
    fn ceiling_without_event_is_valid() {
        let mut validator = PreflightValidator::new(16);
        assert_eq!(validator.push(b"data: {\"choi"), PreflightVerdict::Pending);
        assert_eq!(
            validator.push(b"ces\":[{\"delta\""),
            PreflightVerdict::Valid
        );
    }

    #[test]
    fn eof_before_event_is_invalid() {
        let mut validator = PreflightValidator::default();
        assert_eq!(validator.push(b": keep-alive\n\n"), PreflightVerdict::Pending);
        assert_eq!(
            validator.finish(),
            PreflightVerdict::Invalid(PreflightFailure::EndOfStream)
        );
    }

    #[test]
    fn eof_flushes_unterminated_event() {
        let mut validator = PreflightValidator::default();
        validator.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}");
        assert_eq!(validator.finish(), PreflightVerdict::Valid);
    }
}
