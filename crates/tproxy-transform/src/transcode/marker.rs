use bytes::Bytes;
use serde_json::{Map, Value, json};
use tproxy_protocol::SseFrame;
use tproxy_protocol::openai::{delta_content, delta_reasoning};
use tproxy_protocol::sse::encode_sse;

use super::TranscodeError;
use super::annotate::parse_chunk;

/// Envelope fields copied from upstream chunks onto synthesized end events.
const ENVELOPE_FIELDS: [&str; 4] = ["id", "object", "created", "model"];

/// Attaches a `reasoning_marker` object to reasoning deltas and emits an
/// explicit end-of-reasoning event when the stream moves on.
#[derive(Debug, Default)]
pub struct MarkerState {
    active: bool,
    /// Characters of reasoning in the current run.
    length: usize,
    envelope: Map<String, Value>,
}

impl MarkerState {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(super) fn on_frame(
        &mut self,
        frame: SseFrame,
        out: &mut Vec<Bytes>,
    ) -> Result<(), TranscodeError> {
        if frame.is_done() {
            self.close_run(out)?;
            out.push(frame.raw);
            return Ok(());
        }

        let Some(mut value) = parse_chunk(&frame) else {
            out.push(frame.raw);
            return Ok(());
        };
        self.remember_envelope(&value);

        let mut saw_reasoning = false;
        let mut saw_content = false;
        let mut saw_finish = false;

        if let Some(choices) = value.get_mut("choices").and_then(Value::as_array_mut) {
            for choice in choices.iter_mut() {
                saw_finish |= choice
                    .get("finish_reason")
                    .is_some_and(|reason| !reason.is_null());
                let Some(delta) = choice.get_mut("delta") else {
                    continue;
                };
                saw_content |= delta_content(delta).is_some();
                let Some(text) = delta_reasoning(delta).map(str::to_string) else {
                    continue;
                };
                let start = !self.active;
                self.active = true;
                self.length += text.chars().count();
                saw_reasoning = true;
                if let Some(delta) = delta.as_object_mut() {
                    delta.insert(
                        "reasoning_marker".to_string(),
                        json!({"text": text, "start": start, "active": true}),
                    );
                }
            }
        }

        if saw_reasoning {
            let data = serde_json::to_string(&value)?;
            out.push(encode_sse(frame.event.as_deref(), &data));
            // Content or finish riding in the same chunk follows the reasoning.
            if saw_content || saw_finish {
                self.close_run(out)?;
            }
            return Ok(());
        }

        if saw_content || saw_finish {
            self.close_run(out)?;
        }
        out.push(frame.raw);
        Ok(())
    }

    pub(super) fn on_end(&mut self, out: &mut Vec<Bytes>) -> Result<(), TranscodeError> {
        self.close_run(out)
    }

    fn remember_envelope(&mut self, value: &Value) {
        for field in ENVELOPE_FIELDS {
            if let Some(v) = value.get(field) {
                self.envelope.insert(field.to_string(), v.clone());
            }
        }
    }

    fn close_run(&mut self, out: &mut Vec<Bytes>) -> Result<(), TranscodeError> {
        if !self.active {
            return Ok(());
        }
        let mut event = self.envelope.clone();
        event.insert(
            "choices".to_string(),
            json!([{
                "index": 0,
                "delta": {
                    "reasoning_marker": {"active": false, "end": true, "length": self.length}
                },
                "finish_reason": null
            }]),
        );
        self.active = false;
        self.length = 0;
        let data = serde_json::to_string(&Value::Object(event))?;
        out.push(encode_sse(None, &data));
        Ok(())
    }
}
