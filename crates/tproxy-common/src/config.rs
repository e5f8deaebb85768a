use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, ModelClass, TranscodeMode};

/// Per-class admission and rewrite settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSettings {
    pub max_concurrency: usize,
    pub token_cap: u64,
    pub timeout_secs: u64,
}

impl ClassSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteConfig {
    pub clamp_tokens: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationConfig {
    pub enabled: bool,
    pub max_chars: usize,
    pub head_chars: usize,
    pub tail_chars: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernorConfig {
    pub enabled: bool,
    pub base_cooldown_ms: u64,
    pub max_wait_secs: u64,
}

/// Final, merged configuration used by the running process.
///
/// Merge order: CLI > ENV > config file > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub upstream_host: String,
    pub upstream_port: u16,
    /// When false, requests are piped through untouched.
    pub enabled: bool,
    pub thinking: ClassSettings,
    pub standard: ClassSettings,
    pub rewrite: RewriteConfig,
    pub truncation: TruncationConfig,
    pub max_body_bytes: usize,
    pub retry: RetryConfig,
    pub governor: GovernorConfig,
    pub transcode: TranscodeMode,
    /// Writes one diagnostic log line per request.
    pub diagnostics: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        // Infallible: the empty patch only takes defaults, which validate.
        ProxyConfigPatch::default().build()
    }
}

impl ProxyConfig {
    pub fn class(&self, class: ModelClass) -> &ClassSettings {
        match class {
            ModelClass::Thinking => &self.thinking,
            ModelClass::Standard => &self.standard,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn upstream_base_url(&self) -> String {
        format!("http://{}:{}", self.upstream_host, self.upstream_port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::invalid("port", "must be non-zero"));
        }
        if self.upstream_port == 0 {
            return Err(ConfigError::invalid("upstream_port", "must be non-zero"));
        }
        if self.upstream_host.trim().is_empty() {
            return Err(ConfigError::invalid("upstream_host", "must not be empty"));
        }
        for class in ModelClass::ALL {
            let settings = self.class(class);
            if settings.timeout_secs == 0 {
                return Err(ConfigError::invalid(
                    match class {
                        ModelClass::Thinking => "thinking_timeout_secs",
                        ModelClass::Standard => "standard_timeout_secs",
                    },
                    "must be non-zero",
                ));
            }
        }
        let truncation = &self.truncation;
        if truncation.head_chars + truncation.tail_chars > truncation.max_chars {
            return Err(ConfigError::TruncationSpan {
                head: truncation.head_chars,
                tail: truncation.tail_chars,
                max: truncation.max_chars,
            });
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::invalid("max_body_bytes", "must be non-zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry_max_attempts", "must be at least 1"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::invalid(
                "retry_max_delay_ms",
                "must not be below retry_base_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Optional layer used for merging configuration sources.
///
/// Keys are flat so the same shape serves the JSON config file, environment
/// variables and CLI flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProxyConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub upstream_host: Option<String>,
    pub upstream_port: Option<u16>,
    pub enabled: Option<bool>,
    pub thinking_max_concurrency: Option<usize>,
    pub thinking_token_cap: Option<u64>,
    pub thinking_timeout_secs: Option<u64>,
    pub standard_max_concurrency: Option<usize>,
    pub standard_token_cap: Option<u64>,
    pub standard_timeout_secs: Option<u64>,
    pub clamp_tokens: Option<bool>,
    pub truncation_enabled: Option<bool>,
    pub truncation_max_chars: Option<usize>,
    pub truncation_head_chars: Option<usize>,
    pub truncation_tail_chars: Option<usize>,
    pub max_body_bytes: Option<usize>,
    pub retry_enabled: Option<bool>,
    pub retry_max_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub governor_enabled: Option<bool>,
    pub governor_base_cooldown_ms: Option<u64>,
    pub governor_max_wait_secs: Option<u64>,
    pub transcode: Option<TranscodeMode>,
    pub diagnostics: Option<bool>,
}

macro_rules! overlay_fields {
    ($target:ident, $other:ident, $($field:ident),+ $(,)?) => {
        $(
            if $other.$field.is_some() {
                $target.$field = $other.$field;
            }
        )+
    };
}

impl ProxyConfigPatch {
    pub fn overlay(&mut self, other: ProxyConfigPatch) {
        overlay_fields!(
            self,
            other,
            host,
            port,
            upstream_host,
            upstream_port,
            enabled,
            thinking_max_concurrency,
            thinking_token_cap,
            thinking_timeout_secs,
            standard_max_concurrency,
            standard_token_cap,
            standard_timeout_secs,
            clamp_tokens,
            truncation_enabled,
            truncation_max_chars,
            truncation_head_chars,
            truncation_tail_chars,
            max_body_bytes,
            retry_enabled,
            retry_max_attempts,
            retry_base_delay_ms,
            retry_max_delay_ms,
            governor_enabled,
            governor_base_cooldown_ms,
            governor_max_wait_secs,
            transcode,
            diagnostics,
        );
    }

    pub fn into_config(self) -> Result<ProxyConfig, ConfigError> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }

    fn build(self) -> ProxyConfig {
        ProxyConfig {
            host: self.host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: self.port.unwrap_or(8788),
            upstream_host: self
                .upstream_host
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            upstream_port: self.upstream_port.unwrap_or(8080),
            enabled: self.enabled.unwrap_or(true),
            thinking: ClassSettings {
                // A bound of zero would stall the class forever.
                max_concurrency: self.thinking_max_concurrency.unwrap_or(1).max(1),
                token_cap: self.thinking_token_cap.unwrap_or(8192),
                timeout_secs: self.thinking_timeout_secs.unwrap_or(300),
            },
            standard: ClassSettings {
                max_concurrency: self.standard_max_concurrency.unwrap_or(3).max(1),
                token_cap: self.standard_token_cap.unwrap_or(16384),
                timeout_secs: self.standard_timeout_secs.unwrap_or(600),
            },
            rewrite: RewriteConfig {
                clamp_tokens: self.clamp_tokens.unwrap_or(true),
            },
            truncation: TruncationConfig {
                enabled: self.truncation_enabled.unwrap_or(true),
                max_chars: self.truncation_max_chars.unwrap_or(20_000),
                head_chars: self.truncation_head_chars.unwrap_or(8_000),
                tail_chars: self.truncation_tail_chars.unwrap_or(4_000),
            },
            max_body_bytes: self.max_body_bytes.unwrap_or(10 * 1024 * 1024),
            retry: RetryConfig {
                enabled: self.retry_enabled.unwrap_or(true),
                max_attempts: self.retry_max_attempts.unwrap_or(5),
                base_delay_ms: self.retry_base_delay_ms.unwrap_or(1_000),
                max_delay_ms: self.retry_max_delay_ms.unwrap_or(30_000),
            },
            governor: GovernorConfig {
                enabled: self.governor_enabled.unwrap_or(true),
                base_cooldown_ms: self.governor_base_cooldown_ms.unwrap_or(1_000),
                max_wait_secs: self.governor_max_wait_secs.unwrap_or(120),
            },
            transcode: self.transcode.unwrap_or_default(),
            diagnostics: self.diagnostics.unwrap_or(false),
        }
    }
}

impl From<ProxyConfig> for ProxyConfigPatch {
    fn from(value: ProxyConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            upstream_host: Some(value.upstream_host),
            upstream_port: Some(value.upstream_port),
            enabled: Some(value.enabled),
            thinking_max_concurrency: Some(value.thinking.max_concurrency),
            thinking_token_cap: Some(value.thinking.token_cap),
            thinking_timeout_secs: Some(value.thinking.timeout_secs),
            standard_max_concurrency: Some(value.standard.max_concurrency),
            standard_token_cap: Some(value.standard.token_cap),
            standard_timeout_secs: Some(value.standard.timeout_secs),
            clamp_tokens: Some(value.rewrite.clamp_tokens),
            truncation_enabled: Some(value.truncation.enabled),
            truncation_max_chars: Some(value.truncation.max_chars),
            truncation_head_chars: Some(value.truncation.head_chars),
            truncation_tail_chars: Some(value.truncation.tail_chars),
            max_body_bytes: Some(value.max_body_bytes),
            retry_enabled: Some(value.retry.enabled),
            retry_max_attempts: Some(value.retry.max_attempts),
            retry_base_delay_ms: Some(value.retry.base_delay_ms),
            retry_max_delay_ms: Some(value.retry.max_delay_ms),
            governor_enabled: Some(value.governor.enabled),
            governor_base_cooldown_ms: Some(value.governor.base_cooldown_ms),
            governor_max_wait_secs: Some(value.governor.max_wait_secs),
            transcode: Some(value.transcode),
            diagnostics: Some(value.diagnostics),
        }
    }
}
