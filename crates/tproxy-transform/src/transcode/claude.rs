use bytes::Bytes;
use tproxy_protocol::SseFrame;
use tproxy_protocol::claude::{
    ContentBlock, ContentBlockDelta, JsonObject, MessageDelta, StopReason, StreamEvent,
    StreamMessage, StreamUsage,
};
use tproxy_protocol::openai::{
    ChatCompletionChunk, CompletionUsage, FunctionCallDelta, ToolCallChunk,
};

use super::TranscodeError;

/// Legacy `function_call` deltas share the tool block bookkeeping under this key.
const FUNCTION_CALL_KEY: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Thinking,
    Text,
    Tool(i64),
}

#[derive(Debug, Clone, Copy)]
struct OpenBlock {
    index: u32,
    kind: BlockKind,
}

/// Re-encodes an OpenAI chat-completion stream as the block-based messages
/// stream: thinking, text and tool_use blocks opened and closed in order.
#[derive(Debug)]
pub struct ClaudeDialectState {
    message_started: bool,
    /// Set by the upstream finish signal. The closing events wait for
    /// `[DONE]` or end of stream so a trailing usage chunk is still counted.
    stop_reason: Option<StopReason>,
    closed: bool,
    next_block_index: u32,
    open_block: Option<OpenBlock>,
    usage: Option<StreamUsage>,
}

impl Default for ClaudeDialectState {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeDialectState {
    pub fn new() -> Self {
        Self {
            message_started: false,
            stop_reason: None,
            closed: false,
            next_block_index: 0,
            open_block: None,
            usage: None,
        }
    }

    pub(super) fn on_frame(
        &mut self,
        frame: SseFrame,
        out: &mut Vec<Bytes>,
    ) -> Result<(), TranscodeError> {
        if frame.is_done() {
            return self.on_end(out);
        }
        let Some(data) = frame.data.as_deref() else {
            // Keep-alive comments are valid in either dialect.
            out.push(frame.raw);
            return Ok(());
        };
        let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(data) else {
            out.push(frame.raw);
            return Ok(());
        };
        if self.closed {
            return Ok(());
        }
        for event in self.transform_chunk(chunk) {
            out.push(event.to_sse()?);
        }
        Ok(())
    }

    /// Emits `message_delta` and `message_stop`. A stream that ended without
    /// a finish signal is closed as `end_turn`.
    pub(super) fn on_end(&mut self, out: &mut Vec<Bytes>) -> Result<(), TranscodeError> {
        if !self.message_started || self.closed {
            return Ok(());
        }
        let mut events = Vec::new();
        self.close_message(&mut events);
        for event in events {
            out.push(event.to_sse()?);
        }
        Ok(())
    }

    fn transform_chunk(&mut self, chunk: ChatCompletionChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if !self.message_started {
            self.message_started = true;
            let id = chunk.id.clone().unwrap_or_else(|| "unknown".to_string());
            let model = chunk.model.clone().unwrap_or_else(|| "unknown".to_string());
            events.push(StreamEvent::MessageStart {
                message: StreamMessage::assistant(id, model),
            });
        }

        if let Some(usage) = map_usage(chunk.usage.as_ref()) {
            self.usage = Some(usage);
        }
        if self.stop_reason.is_some() {
            return events;
        }

        let Some(choice) = chunk.first_choice() else {
            return events;
        };

        if let Some(delta) = &choice.delta {
            if let Some(reasoning) = delta.reasoning_text() {
                self.emit_fragment(BlockKind::Thinking, reasoning, &mut events);
            }
            if let Some(content) = delta.content_text() {
                self.emit_fragment(BlockKind::Text, content, &mut events);
            }
            if let Some(tool_calls) = &delta.tool_calls {
                for call in tool_calls {
                    self.emit_tool_call(call, &mut events);
                }
            }
            if let Some(function_call) = &delta.function_call {
                self.emit_function_call(function_call, &mut events);
            }
        }

        if let Some(reason) = choice.finish_reason.as_deref() {
            self.close_open_block(&mut events);
            self.stop_reason = Some(map_finish_reason(reason));
        }

        events
    }

    fn emit_fragment(&mut self, kind: BlockKind, text: &str, events: &mut Vec<StreamEvent>) {
        let index = self.ensure_block(kind, events, || match kind {
            BlockKind::Thinking => ContentBlock::Thinking {
                thinking: String::new(),
            },
            _ => ContentBlock::Text {
                text: String::new(),
            },
        });
        let delta = match kind {
            BlockKind::Thinking => ContentBlockDelta::ThinkingDelta {
                thinking: text.to_string(),
            },
            _ => ContentBlockDelta::TextDelta {
                text: text.to_string(),
            },
        };
        events.push(StreamEvent::ContentBlockDelta { index, delta });
    }

    fn emit_tool_call(&mut self, call: &ToolCallChunk, events: &mut Vec<StreamEvent>) {
        let key = call.index;
        let index = self.ensure_block(BlockKind::Tool(key), events, || ContentBlock::ToolUse {
            id: call
                .id
                .clone()
                .unwrap_or_else(|| format!("toolcall-{key}")),
            name: call
                .function
                .as_ref()
                .and_then(|function| function.name.clone())
                .unwrap_or_else(|| "tool".to_string()),
            input: JsonObject::new(),
        });
        let arguments = call
            .function
            .as_ref()
            .and_then(|function| function.arguments.as_deref())
            .filter(|arguments| !arguments.is_empty());
        if let Some(arguments) = arguments {
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: ContentBlockDelta::InputJsonDelta {
                    partial_json: arguments.to_string(),
                },
            });
        }
    }

    fn emit_function_call(&mut self, call: &FunctionCallDelta, events: &mut Vec<StreamEvent>) {
        let index = self.ensure_block(BlockKind::Tool(FUNCTION_CALL_KEY), events, || {
            ContentBlock::ToolUse {
                id: "function_call".to_string(),
                name: call
                    .name
                    .clone()
                    .unwrap_or_else(|| "function_call".to_string()),
                input: JsonObject::new(),
            }
        });
        if let Some(arguments) = call.arguments.as_deref().filter(|a| !a.is_empty()) {
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: ContentBlockDelta::InputJsonDelta {
                    partial_json: arguments.to_string(),
                },
            });
        }
    }

    /// Returns the index of the open block of `kind`, closing whatever else
    /// is open and starting a new block when needed.
    fn ensure_block(
        &mut self,
        kind: BlockKind,
        events: &mut Vec<StreamEvent>,
        content_block: impl FnOnce() -> ContentBlock,
    ) -> u32 {
        if let Some(open) = self.open_block {
            if open.kind == kind {
                return open.index;
            }
        }
        self.close_open_block(events);
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.open_block = Some(OpenBlock { index, kind });
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: content_block(),
        });
        index
    }

    fn close_open_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(open) = self.open_block.take() {
            events.push(StreamEvent::ContentBlockStop { index: open.index });
        }
    }

    fn close_message(&mut self, events: &mut Vec<StreamEvent>) {
        self.close_open_block(events);
        events.push(StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(self.stop_reason.unwrap_or(StopReason::EndTurn)),
                stop_sequence: None,
            },
            usage: self.usage.clone().unwrap_or_default(),
        });
        events.push(StreamEvent::MessageStop);
        self.closed = true;
    }
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

fn map_usage(usage: Option<&CompletionUsage>) -> Option<StreamUsage> {
    let usage = usage?;
    Some(StreamUsage {
        input_tokens: Some(usage.prompt_tokens.max(0) as u32),
        output_tokens: Some(usage.completion_tokens.max(0) as u32),
    })
}
