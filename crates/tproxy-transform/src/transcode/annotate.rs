use bytes::Bytes;
use serde_json::Value;
use tproxy_protocol::SseFrame;
use tproxy_protocol::openai::delta_reasoning;
use tproxy_protocol::sse::encode_sse;

use super::TranscodeError;

/// Flags reasoning deltas with `"is_reasoning": true`; all other events pass
/// through byte for byte.
#[derive(Debug, Default)]
pub struct AnnotateState {
    annotated: u64,
}

impl AnnotateState {
    pub fn annotated(&self) -> u64 {
        self.annotated
    }

    pub(super) fn on_frame(
        &mut self,
        frame: SseFrame,
        out: &mut Vec<Bytes>,
    ) -> Result<(), TranscodeError> {
        let Some(mut value) = parse_chunk(&frame) else {
            out.push(frame.raw);
            return Ok(());
        };

        let mut touched = false;
        if let Some(choices) = value.get_mut("choices").and_then(Value::as_array_mut) {
            for choice in choices.iter_mut() {
                let Some(delta) = choice.get_mut("delta") else {
                    continue;
                };
                if delta_reasoning(delta).is_none() {
                    continue;
                }
                if let Some(delta) = delta.as_object_mut() {
                    delta.insert("is_reasoning".to_string(), Value::Bool(true));
                    touched = true;
                }
            }
        }

        if touched {
            self.annotated += 1;
            let data = serde_json::to_string(&value)?;
            out.push(encode_sse(frame.event.as_deref(), &data));
        } else {
            out.push(frame.raw);
        }
        Ok(())
    }
}

/// Decoded JSON payload of a data event; `None` for comments, `[DONE]` and
/// anything that is not JSON.
pub(super) fn parse_chunk(frame: &SseFrame) -> Option<Value> {
    if frame.is_done() {
        return None;
    }
    let data = frame.data.as_deref()?;
    serde_json::from_str(data).ok()
}
