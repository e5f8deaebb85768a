use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::Response;
use axum::routing::{get, post};
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tproxy_common::{ModelClass, ProxyConfigPatch, TranscodeMode};
use tproxy_core::{
    Core, Event, REQUEST_ID_HEADER, ReqwestUpstreamClient, STATUS_PATH, UpstreamClientConfig,
};

#[derive(Default)]
struct Mock {
    flaky_calls: AtomicUsize,
    limited_calls: AtomicUsize,
    last_body: Mutex<Option<Value>>,
}

fn json_response(status: StatusCode, body: Value) -> Response {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn sse_response(body: &'static str) -> Response {
    Response::builder()
        .header(CONTENT_TYPE, "text/event-stream")
        .body(Body::from(body))
        .unwrap()
}

async fn chat(State(mock): State<Arc<Mock>>, body: Bytes) -> Response {
    let value: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    *mock.last_body.lock().unwrap() = Some(value.clone());
    match value["model"].as_str().unwrap_or_default() {
        "flaky-thinking" => {
            if mock.flaky_calls.fetch_add(1, Ordering::SeqCst) < 2 {
                json_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    json!({"error": "rate limit exceeded"}),
                )
            } else {
                json_response(StatusCode::OK, json!({"max_tokens": value["max_tokens"]}))
            }
        }
        "always-limited" => {
            mock.limited_calls.fetch_add(1, Ordering::SeqCst);
            json_response(
                StatusCode::TOO_MANY_REQUESTS,
                json!({"error": "rate limit exceeded"}),
            )
        }
        "empty-stream" => sse_response("data: {\"choices\":[]}\n\n"),
        "stream-model" => sse_response(
            "data: {\"id\":\"c1\",\"model\":\"stream-model\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\n\
             data: {\"id\":\"c1\",\"model\":\"stream-model\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n\
             data: [DONE]\n\n",
        ),
        "slow-stream" => {
            let chunks = futures_util::stream::unfold(0u32, |n| async move {
                if n > 0 {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                let chunk = format!(
                    "data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"t{n}\"}}}}]}}\n\n"
                );
                (n < 600).then(|| (Ok::<_, std::io::Error>(Bytes::from(chunk)), n + 1))
            });
            Response::builder()
                .header(CONTENT_TYPE, "text/event-stream")
                .body(Body::from_stream(chunks))
                .unwrap()
        }
        "slow" => {
            tokio::time::sleep(Duration::from_secs(3)).await;
            json_response(StatusCode::OK, json!({"late": true}))
        }
        _ => json_response(StatusCode::OK, json!({"ok": true})),
    }
}

async fn models() -> Response {
    json_response(StatusCode::OK, json!({"data": [{"id": "m"}]}))
}

async fn spawn_upstream() -> (u16, Arc<Mock>) {
    let mock = Arc::new(Mock::default());
    let app = Router::new()
        .route("/v1/chat/completions", post(chat))
        .route("/v1/models", get(models))
        .with_state(mock.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, mock)
}

struct Harness {
    base: String,
    core: Core,
    mock: Arc<Mock>,
    client: reqwest::Client,
}

async fn harness(patch: ProxyConfigPatch) -> Harness {
    let (upstream_port, mock) = spawn_upstream().await;
    let config = ProxyConfigPatch {
        upstream_port: Some(upstream_port),
        retry_base_delay_ms: Some(10),
        retry_max_delay_ms: Some(100),
        governor_base_cooldown_ms: Some(10),
        governor_max_wait_secs: Some(5),
        ..patch
    }
    .into_config()
    .unwrap();

    let client = ReqwestUpstreamClient::new(UpstreamClientConfig::default()).unwrap();
    let core = Core::new(config, Arc::new(client));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let router = core.router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Harness {
        base,
        core,
        mock,
        client: reqwest::Client::new(),
    }
}

impl Harness {
    async fn post_chat(&self, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}/v1/chat/completions", self.base))
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .unwrap()
    }
}

fn standard_running(core: &Core) -> usize {
    core.status()
        .admission
        .iter()
        .find(|stats| stats.class == ModelClass::Standard)
        .map(|stats| stats.running)
        .unwrap()
}

async fn json_body(resp: reqwest::Response) -> Value {
    serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limits_are_retried_and_tokens_clamped() {
    let h = harness(ProxyConfigPatch {
        thinking_token_cap: Some(2048),
        ..Default::default()
    })
    .await;
    let mut events = h.core.events().subscribe();

    let resp = h
        .post_chat(json!({"model": "flaky-thinking", "max_tokens": 8000}))
        .await;
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key(REQUEST_ID_HEADER));
    assert_eq!(json_body(resp).await["max_tokens"], 2048);
    assert_eq!(h.mock.flaky_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.core.status().governor.consecutive_failures, 0);

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(Event::Request(event)) = events.recv().await {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event.attempts, 3);
    assert_eq!(event.status, 200);
    assert_eq!(event.token_rewrites.len(), 1);
    assert_eq!(event.token_rewrites[0].original, 8000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_rate_limit_retries_become_503() {
    let h = harness(ProxyConfigPatch {
        retry_max_attempts: Some(2),
        ..Default::default()
    })
    .await;
    let resp = h.post_chat(json!({"model": "always-limited"})).await;
    assert_eq!(resp.status(), 503);
    let body = json_body(resp).await;
    assert_eq!(body["error"], "upstream_unavailable");
    assert_eq!(body["retryable"], true);
    assert!(!body.to_string().contains("rate limit exceeded"));
    assert_eq!(h.mock.limited_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_body_is_refused() {
    let h = harness(ProxyConfigPatch {
        max_body_bytes: Some(64),
        ..Default::default()
    })
    .await;
    let resp = h
        .post_chat(json!({"model": "m", "messages": [{"role": "user", "content": "x".repeat(200)}]}))
        .await;
    assert_eq!(resp.status(), 413);
    assert!(resp.headers().contains_key(REQUEST_ID_HEADER));
    assert!(h.mock.last_body.lock().unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_choices_stream_is_rejected_before_headers() {
    let h = harness(ProxyConfigPatch::default()).await;
    let resp = h
        .post_chat(json!({"model": "empty-stream", "stream": true}))
        .await;
    assert_eq!(resp.status(), 502);
    assert_eq!(json_body(resp).await["error"], "upstream_malformed_stream");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_upstream_times_out() {
    let h = harness(ProxyConfigPatch {
        standard_timeout_secs: Some(1),
        ..Default::default()
    })
    .await;
    let resp = h.post_chat(json!({"model": "slow"})).await;
    assert_eq!(resp.status(), 504);
    assert_eq!(json_body(resp).await["error"], "upstream_timeout");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_is_transcoded_to_claude_events() {
    let h = harness(ProxyConfigPatch {
        transcode: Some(TranscodeMode::Claude),
        ..Default::default()
    })
    .await;
    let resp = h
        .post_chat(json!({"model": "stream-model", "stream": true}))
        .await;
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().get("content-length").is_none());
    assert_eq!(resp.headers()["cache-control"], "no-cache");
    let text = resp.text().await.unwrap();
    assert!(text.starts_with("event: message_start"));
    assert!(text.contains("\"text_delta\""));
    assert!(text.contains("\"end_turn\""));
    assert!(text.contains("event: message_stop"));
    assert!(!text.contains("[DONE]"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_disconnect_mid_stream_releases_admission_slot() {
    let h = harness(ProxyConfigPatch::default()).await;
    let mut events = h.core.events().subscribe();
    let mut resp = h
        .post_chat(json!({"model": "slow-stream", "stream": true}))
        .await;
    assert_eq!(resp.status(), 200);
    let first = resp.chunk().await.unwrap().unwrap();
    assert!(first.starts_with(b"data: "));
    assert_eq!(standard_running(&h.core), 1);

    drop(resp);
    let event = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(Event::Request(event)) = events.recv().await {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(
        event.stream_outcome.map(|outcome| outcome.as_str()),
        Some("client_disconnected")
    );
    assert_eq!(standard_running(&h.core), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_passes_through_when_transcoding_is_off() {
    let h = harness(ProxyConfigPatch::default()).await;
    let resp = h
        .post_chat(json!({"model": "stream-model", "stream": true}))
        .await;
    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.starts_with("data: {\"id\":\"c1\""));
    assert!(text.ends_with("data: [DONE]\n\n"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn other_paths_are_relayed_untouched() {
    let h = harness(ProxyConfigPatch::default()).await;
    let resp = h
        .client
        .get(format!("{}/v1/models", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(json_body(resp).await["data"][0]["id"], "m");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_endpoint_reports_governor_and_queues() {
    let h = harness(ProxyConfigPatch::default()).await;
    let resp = h
        .client
        .get(format!("{}{}", h.base, STATUS_PATH))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["enabled"], true);
    assert_eq!(body["governor"]["consecutive_failures"], 0);
    assert_eq!(body["admission"].as_array().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_upstream_is_502() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);

    let h = harness(ProxyConfigPatch::default()).await;
    let mut config = (*h.core.config()).clone();
    config.upstream_port = dead_port;
    h.core.update_config(config);

    let resp = h.post_chat(json!({"model": "m"})).await;
    assert_eq!(resp.status(), 502);
    assert_eq!(json_body(resp).await["error"], "upstream_connect_failed");
}
