use bytes::Bytes;

pub const DONE_PAYLOAD: &str = "[DONE]";

/// One blank-line-delimited SSE event block.
///
/// `raw` holds the exact bytes the block arrived as (terminating blank line
/// included), so strategies that leave an event untouched can forward it
/// verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub raw: Bytes,
    pub event: Option<String>,
    pub data: Option<String>,
}

impl SseFrame {
    pub fn is_done(&self) -> bool {
        self.data
            .as_deref()
            .is_some_and(|data| data.trim() == DONE_PAYLOAD)
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }
}

/// Incremental SSE parser.
///
/// Bytes accumulate in `buffer`; `cursor` marks the start of the first
/// unconsumed frame and `scan` the point up to which lines are already known
/// not to terminate a frame, so no byte is examined twice.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    cursor: usize,
    scan: usize,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(offset) = self.buffer[self.scan..].iter().position(|b| *b == b'\n') {
            let line_end = self.scan + offset;
            let line = trim_cr(&self.buffer[self.scan..line_end]);
            let line_is_blank = line.is_empty();
            self.scan = line_end + 1;

            if !line_is_blank {
                continue;
            }

            let start = self.cursor;
            self.cursor = self.scan;
            if let Some(frame) = parse_frame(&self.buffer[start..self.cursor]) {
                frames.push(frame);
            }
        }

        self.compact();
        frames
    }

    /// Flushes a trailing event that never got its terminating blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = &self.buffer[self.cursor..];
        let frame = if rest.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            parse_frame(rest)
        };
        self.buffer.clear();
        self.cursor = 0;
        self.scan = 0;
        frame
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    fn compact(&mut self) {
        if self.cursor == 0 {
            return;
        }
        if self.cursor == self.buffer.len() || self.cursor >= self.buffer.len() / 2 {
            self.buffer.drain(..self.cursor);
            self.scan -= self.cursor;
            self.cursor = 0;
        }
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn parse_frame(block: &[u8]) -> Option<SseFrame> {
    let mut event = None;
    let mut data_lines: Vec<String> = Vec::new();
    let mut meaningful = false;

    for line in block.split(|b| *b == b'\n') {
        let line = trim_cr(line);
        if line.is_empty() {
            continue;
        }
        meaningful = true;
        if line.starts_with(b":") {
            continue;
        }
        let line = String::from_utf8_lossy(line);
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            event = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
            continue;
        }
        if line == "event" {
            event = None;
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            continue;
        }
        if line == "data" {
            data_lines.push(String::new());
        }
    }

    if !meaningful {
        return None;
    }

    Some(SseFrame {
        raw: Bytes::copy_from_slice(block),
        event,
        data: if data_lines.is_empty() {
            None
        } else {
            Some(data_lines.join("\n"))
        },
    })
}

pub fn encode_sse(event: Option<&str>, data: &str) -> Bytes {
    let mut out = Vec::with_capacity(data.len() + 32);
    if let Some(name) = event {
        out.extend_from_slice(b"event: ");
        out.extend_from_slice(name.as_bytes());
        out.push(b'\n');
    }
    for line in data.split('\n') {
        out.extend_from_slice(b"data: ");
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
    }
    out.push(b'\n');
    Bytes::from(out)
}

pub fn encode_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}
