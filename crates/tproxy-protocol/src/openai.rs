//! Lenient view of the OpenAI chat-completion stream chunk.
//!
//! Only the fields the transcoders read are modelled; everything is optional
//! so a partially populated chunk still decodes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Delta fields that carry intermediate reasoning text, in lookup order.
pub const REASONING_FIELDS: [&str; 2] = ["reasoning_content", "reasoning"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Option<Vec<ChunkChoice>>,
    #[serde(default)]
    pub usage: Option<CompletionUsage>,
}

impl ChatCompletionChunk {
    pub fn first_choice(&self) -> Option<&ChunkChoice> {
        self.choices.as_ref().and_then(|choices| choices.first())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Option<ChunkDelta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallChunk>>,
    #[serde(default)]
    pub function_call: Option<FunctionCallDelta>,
}

impl ChunkDelta {
    pub fn reasoning_text(&self) -> Option<&str> {
        self.reasoning_content
            .as_deref()
            .filter(|text| !text.is_empty())
            .or_else(|| self.reasoning.as_deref().filter(|text| !text.is_empty()))
    }

    pub fn content_text(&self) -> Option<&str> {
        self.content.as_deref().filter(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallChunk {
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionCallDelta>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionUsage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
}

/// Reasoning text carried by a raw JSON delta object, if any.
pub fn delta_reasoning(delta: &Value) -> Option<&str> {
    REASONING_FIELDS.iter().find_map(|field| {
        delta
            .get(field)
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
    })
}

/// Non-empty `content` string carried by a raw JSON delta object, if any.
pub fn delta_content(delta: &Value) -> Option<&str> {
    delta
        .get("content")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
}
