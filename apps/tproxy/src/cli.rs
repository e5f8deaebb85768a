use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tproxy_common::{ProxyConfig, ProxyConfigPatch, TranscodeMode};

/// Every flag can also be set through its `TPROXY_*` environment variable.
/// Precedence: flag > environment > config file > defaults.
#[derive(Debug, Parser)]
#[command(name = "tproxy", version, about)]
pub(crate) struct Cli {
    /// JSON file with flat configuration keys, e.g. `{"thinking_token_cap": 4096}`.
    #[arg(long, env = "TPROXY_CONFIG")]
    pub(crate) config: Option<PathBuf>,
    /// Print the merged configuration as JSON and exit.
    #[arg(long)]
    pub(crate) print_config: bool,

    #[arg(long, env = "TPROXY_HOST")]
    pub(crate) host: Option<String>,
    #[arg(long, env = "TPROXY_PORT")]
    pub(crate) port: Option<u16>,
    #[arg(long, env = "TPROXY_UPSTREAM_HOST")]
    pub(crate) upstream_host: Option<String>,
    #[arg(long, env = "TPROXY_UPSTREAM_PORT")]
    pub(crate) upstream_port: Option<u16>,
    /// When false every request is relayed untouched.
    #[arg(long, env = "TPROXY_ENABLED", value_name = "BOOL")]
    pub(crate) enabled: Option<bool>,

    #[arg(long, env = "TPROXY_THINKING_MAX_CONCURRENCY")]
    pub(crate) thinking_max_concurrency: Option<usize>,
    #[arg(long, env = "TPROXY_THINKING_TOKEN_CAP")]
    pub(crate) thinking_token_cap: Option<u64>,
    #[arg(long, env = "TPROXY_THINKING_TIMEOUT_SECS")]
    pub(crate) thinking_timeout_secs: Option<u64>,
    #[arg(long, env = "TPROXY_STANDARD_MAX_CONCURRENCY")]
    pub(crate) standard_max_concurrency: Option<usize>,
    #[arg(long, env = "TPROXY_STANDARD_TOKEN_CAP")]
    pub(crate) standard_token_cap: Option<u64>,
    #[arg(long, env = "TPROXY_STANDARD_TIMEOUT_SECS")]
    pub(crate) standard_timeout_secs: Option<u64>,

    #[arg(long, env = "TPROXY_CLAMP_TOKENS", value_name = "BOOL")]
    pub(crate) clamp_tokens: Option<bool>,
    #[arg(long, env = "TPROXY_TRUNCATION_ENABLED", value_name = "BOOL")]
    pub(crate) truncation_enabled: Option<bool>,
    #[arg(long, env = "TPROXY_TRUNCATION_MAX_CHARS")]
    pub(crate) truncation_max_chars: Option<usize>,
    #[arg(long, env = "TPROXY_TRUNCATION_HEAD_CHARS")]
    pub(crate) truncation_head_chars: Option<usize>,
    #[arg(long, env = "TPROXY_TRUNCATION_TAIL_CHARS")]
    pub(crate) truncation_tail_chars: Option<usize>,
    #[arg(long, env = "TPROXY_MAX_BODY_BYTES")]
    pub(crate) max_body_bytes: Option<usize>,

    #[arg(long, env = "TPROXY_RETRY_ENABLED", value_name = "BOOL")]
    pub(crate) retry_enabled: Option<bool>,
    #[arg(long, env = "TPROXY_RETRY_MAX_ATTEMPTS")]
    pub(crate) retry_max_attempts: Option<u32>,
    #[arg(long, env = "TPROXY_RETRY_BASE_DELAY_MS")]
    pub(crate) retry_base_delay_ms: Option<u64>,
    #[arg(long, env = "TPROXY_RETRY_MAX_DELAY_MS")]
    pub(crate) retry_max_delay_ms: Option<u64>,

    #[arg(long, env = "TPROXY_GOVERNOR_ENABLED", value_name = "BOOL")]
    pub(crate) governor_enabled: Option<bool>,
    #[arg(long, env = "TPROXY_GOVERNOR_BASE_COOLDOWN_MS")]
    pub(crate) governor_base_cooldown_ms: Option<u64>,
    #[arg(long, env = "TPROXY_GOVERNOR_MAX_WAIT_SECS")]
    pub(crate) governor_max_wait_secs: Option<u64>,

    /// off, annotate, marker or claude.
    #[arg(long, env = "TPROXY_TRANSCODE")]
    pub(crate) transcode: Option<TranscodeMode>,
    /// Log a line for every finished request and governor transition.
    #[arg(long, env = "TPROXY_DIAGNOSTICS", value_name = "BOOL")]
    pub(crate) diagnostics: Option<bool>,
}

impl Cli {
    fn patch(&self) -> ProxyConfigPatch {
        ProxyConfigPatch {
            host: self.host.clone(),
            port: self.port,
            upstream_host: self.upstream_host.clone(),
            upstream_port: self.upstream_port,
            enabled: self.enabled,
            thinking_max_concurrency: self.thinking_max_concurrency,
            thinking_token_cap: self.thinking_token_cap,
            thinking_timeout_secs: self.thinking_timeout_secs,
            standard_max_concurrency: self.standard_max_concurrency,
            standard_token_cap: self.standard_token_cap,
            standard_timeout_secs: self.standard_timeout_secs,
            clamp_tokens: self.clamp_tokens,
            truncation_enabled: self.truncation_enabled,
            truncation_max_chars: self.truncation_max_chars,
            truncation_head_chars: self.truncation_head_chars,
            truncation_tail_chars: self.truncation_tail_chars,
            max_body_bytes: self.max_body_bytes,
            retry_enabled: self.retry_enabled,
            retry_max_attempts: self.retry_max_attempts,
            retry_base_delay_ms: self.retry_base_delay_ms,
            retry_max_delay_ms: self.retry_max_delay_ms,
            governor_enabled: self.governor_enabled,
            governor_base_cooldown_ms: self.governor_base_cooldown_ms,
            governor_max_wait_secs: self.governor_max_wait_secs,
            transcode: self.transcode,
            diagnostics: self.diagnostics,
        }
    }

    /// Merges the config file (if any) under flags and environment.
    pub(crate) fn resolve(&self) -> anyhow::Result<ProxyConfig> {
        let mut merged = match &self.config {
            Some(path) => load_patch(path)?,
            None => ProxyConfigPatch::default(),
        };
        merged.overlay(self.patch());
        merged.into_config().context("invalid configuration")
    }
}

fn load_patch(path: &Path) -> anyhow::Result<ProxyConfigPatch> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
}
