use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Model class a governed request is admitted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelClass {
    Thinking,
    Standard,
}

impl ModelClass {
    pub const ALL: [ModelClass; 2] = [ModelClass::Thinking, ModelClass::Standard];

    /// Case-insensitive `thinking` substring match; anything else, including
    /// a missing model, is standard.
    pub fn classify(model: Option<&str>) -> Self {
        match model {
            Some(model) if model.to_ascii_lowercase().contains("thinking") => {
                ModelClass::Thinking
            }
            _ => ModelClass::Standard,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelClass::Thinking => "thinking",
            ModelClass::Standard => "standard",
        }
    }
}

impl fmt::Display for ModelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How streamed chat responses are re-encoded for the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeMode {
    #[default]
    Off,
    Annotate,
    Marker,
    Claude,
}

impl TranscodeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TranscodeMode::Off => "off",
            TranscodeMode::Annotate => "annotate",
            TranscodeMode::Marker => "marker",
            TranscodeMode::Claude => "claude",
        }
    }
}

impl fmt::Display for TranscodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TranscodeMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "" => Ok(TranscodeMode::Off),
            "annotate" => Ok(TranscodeMode::Annotate),
            "marker" | "enhanced" => Ok(TranscodeMode::Marker),
            "claude" => Ok(TranscodeMode::Claude),
            other => Err(ConfigError::UnknownTranscodeMode(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_is_case_insensitive() {
        assert_eq!(
            ModelClass::classify(Some("Qwen3-Thinking-32B")),
            ModelClass::Thinking
        );
        assert_eq!(ModelClass::classify(Some("gpt-4o")), ModelClass::Standard);
        assert_eq!(ModelClass::classify(None), ModelClass::Standard);
    }

    #[test]
    fn transcode_mode_parses_aliases() {
        assert_eq!("Enhanced".parse::<TranscodeMode>().unwrap(), TranscodeMode::Marker);
        assert_eq!("claude".parse::<TranscodeMode>().unwrap(), TranscodeMode::Claude);
        assert!("gemini".parse::<TranscodeMode>().is_err());
    }
}
