use bytes::Bytes;
use http::{HeaderMap, Method};
use serde_json::Value;
use tproxy_common::{ModelClass, ProxyConfig};
use tproxy_transform::{RewritePolicy, RewriteReport, TruncationPolicy, rewrite_request};

const CHAT_PATH_SUFFIXES: [&str; 4] = [
    "/chat/completions",
    "/completions",
    "/responses",
    "/messages",
];

/// Chat-completion-like endpoints are the only ones that pass through the
/// governor and admission queues.
pub fn is_chat_path(path: &str) -> bool {
    let path = path.trim_end_matches('/');
    CHAT_PATH_SUFFIXES
        .iter()
        .any(|suffix| path.ends_with(suffix))
}

pub fn parse_body(body: &[u8]) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice(body).ok()
}

pub fn extract_model(body: &Value) -> Option<String> {
    body.get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .map(str::to_string)
}

pub fn extract_stream(body: &Value) -> Option<bool> {
    body.get("stream").and_then(Value::as_bool)
}

/// Everything known about one inbound request, fixed once rewriting is done.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub model: Option<String>,
    pub stream: Option<bool>,
    /// Set for chat paths while the proxy is enabled.
    pub class: Option<ModelClass>,
    pub rewrite: RewriteReport,
}

impl RequestContext {
    pub fn build(
        method: Method,
        path: String,
        path_and_query: String,
        headers: HeaderMap,
        body: Bytes,
        config: &ProxyConfig,
    ) -> Self {
        let mut parsed = parse_body(&body);
        let model = parsed.as_ref().and_then(extract_model);
        let stream = parsed.as_ref().and_then(extract_stream);
        let class = (config.enabled && is_chat_path(&path))
            .then(|| ModelClass::classify(model.as_deref()));

        let mut ctx = Self {
            method,
            path,
            path_and_query,
            headers,
            body,
            model,
            stream,
            class,
            rewrite: RewriteReport::default(),
        };

        if let (Some(class), Some(value)) = (class, parsed.as_mut()) {
            let policy = rewrite_policy(config, class);
            let report = rewrite_request(value, &policy);
            if report.changed {
                if let Ok(encoded) = serde_json::to_vec(&*value) {
                    ctx.body = Bytes::from(encoded);
                }
            }
            ctx.rewrite = report;
        }
        ctx
    }

    pub fn is_governed(&self) -> bool {
        self.class.is_some()
    }

    pub fn wants_stream(&self) -> bool {
        self.stream == Some(true)
    }
}

pub fn rewrite_policy(config: &ProxyConfig, class: ModelClass) -> RewritePolicy {
    RewritePolicy {
        token_cap: config
            .rewrite
            .clamp_tokens
            .then(|| config.class(class).token_cap),
        truncation: config
            .truncation
            .enabled
            .then(|| TruncationPolicy::from(&config.truncation)),
    }
}
