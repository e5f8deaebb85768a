//! SSE stream transcoders for reasoning-capable chat completions.
//!
//! Each strategy sees whole SSE events; the shared [`SseParser`] takes care of
//! events split across network chunks.

mod annotate;
mod claude;
mod marker;


use bytes::Bytes;
use tproxy_common::TranscodeMode;
use tproxy_protocol::{SseFrame, SseParser};

pub use annotate::AnnotateState;
pub use claude::ClaudeDialectState;
pub use marker::MarkerState;

/// Upper bound on bytes buffered for a single incomplete event.
pub const MAX_PENDING_EVENT_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("failed to encode transcoded event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("incomplete event exceeds {limit} bytes")]
    EventTooLarge { limit: usize },
}

#[derive(Debug)]
pub enum Strategy {
    Annotate(AnnotateState),
    Marker(MarkerState),
    Claude(ClaudeDialectState),
}

impl Strategy {
    fn on_frame(&mut self, frame: SseFrame, out: &mut Vec<Bytes>) -> Result<(), TranscodeError> {
        match self {
            Strategy::Annotate(state) => state.on_frame(frame, out),
            Strategy::Marker(state) => state.on_frame(frame, out),
            Strategy::Claude(state) => state.on_frame(frame, out),
        }
    }

    fn on_end(&mut self, out: &mut Vec<Bytes>) -> Result<(), TranscodeError> {
        match self {
            Strategy::Annotate(_) => Ok(()),
            Strategy::Marker(state) => state.on_end(out),
            Strategy::Claude(state) => state.on_end(out),
        }
    }
}

#[derive(Debug)]
pub struct StreamTranscoder {
    parser: SseParser,
    strategy: Strategy,
    finished: bool,
}

impl StreamTranscoder {
    /// `None` for [`TranscodeMode::Off`]: bytes are piped through untouched.
    pub fn new(mode: TranscodeMode) -> Option<Self> {
        let strategy = match mode {
            TranscodeMode::Off => return None,
            TranscodeMode::Annotate => Strategy::Annotate(AnnotateState::default()),
            TranscodeMode::Marker => Strategy::Marker(MarkerState::default()),
            TranscodeMode::Claude => Strategy::Claude(ClaudeDialectState::new()),
        };
        Some(Self {
            parser: SseParser::new(),
            strategy,
            finished: false,
        })
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, TranscodeError> {
        let mut out = Vec::new();
        for frame in self.parser.push(chunk) {
            self.strategy.on_frame(frame, &mut out)?;
        }
        if self.parser.buffered_len() > MAX_PENDING_EVENT_BYTES {
            return Err(TranscodeError::EventTooLarge {
                limit: MAX_PENDING_EVENT_BYTES,
            });
        }
        Ok(out)
    }

    /// Upstream ended; flushes a trailing event and any closing events the
    /// strategy owes the client.
    pub fn finish(&mut self) -> Result<Vec<Bytes>, TranscodeError> {
        let mut out = Vec::new();
        if self.finished {
            return Ok(out);
        }
        self.finished = true;
        if let Some(frame) = self.parser.finish() {
            self.strategy.on_frame(frame, &mut out)?;
        }
        self.strategy.on_end(&mut out)?;
        Ok(out)
    }
}
