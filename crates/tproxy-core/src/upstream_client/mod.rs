use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::mpsc;

/// Upstream body chunks, fed by a background task. Dropping the receiver
/// stops the task and closes the upstream connection.
pub type ByteStream = mpsc::Receiver<Result<Bytes, UpstreamError>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream connect failed: {0}")]
    Connect(String),
    #[error("upstream timed out: {0}")]
    Timeout(String),
    #[error("upstream transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamError>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub channel_capacity: usize,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            channel_capacity: 16,
        }
    }
}

#[derive(Clone)]
pub struct ReqwestUpstreamClient {
    client: reqwest::Client,
    config: UpstreamClientConfig,
}

impl ReqwestUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, reqwest::Error> {
        // No overall timeout here: per-class deadlines are enforced by the caller.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client, config })
    }
}

impl UpstreamClient for ReqwestUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamError>> + Send + 'a>> {
        Box::pin(async move {
            let resp = self
                .client
                .request(req.method, &req.url)
                .headers(req.headers)
                .body(req.body)
                .send()
                .await
                .map_err(map_reqwest_error)?;

            let status = resp.status();
            let headers = resp.headers().clone();
            let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
            tokio::spawn(pump_body(resp, tx));

            Ok(UpstreamResponse {
                status,
                headers,
                body: rx,
            })
        })
    }
}

async fn pump_body(resp: reqwest::Response, tx: mpsc::Sender<Result<Bytes, UpstreamError>>) {
    let mut stream = resp.bytes_stream();
    loop {
        let item = tokio::select! {
            _ = tx.closed() => break,
            item = stream.next() => item,
        };
        let Some(item) = item else {
            break;
        };
        match item {
            Ok(chunk) => {
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(map_reqwest_error(err))).await;
                break;
            }
        }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> UpstreamError {
    if err.is_connect() {
        return UpstreamError::Connect(err.to_string());
    }
    if err.is_timeout() {
        return UpstreamError::Timeout(err.to_string());
    }
    UpstreamError::Transport(err.to_string())
}
