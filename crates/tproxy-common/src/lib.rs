mod class;
mod config;

pub use class::{ModelClass, TranscodeMode};
pub use config::{
    ClassSettings, GovernorConfig, ProxyConfig, ProxyConfigPatch, RetryConfig, RewriteConfig,
    TruncationConfig,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    #[error("truncation head ({head}) + tail ({tail}) exceeds max chars ({max})")]
    TruncationSpan { head: usize, tail: usize, max: usize },
    #[error("unknown transcode mode: {0}")]
    UnknownTranscodeMode(String),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: &'static str) -> Self {
        ConfigError::InvalidValue { field, reason }
    }
}
