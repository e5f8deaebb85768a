use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tokio::time::{Instant, timeout_at};
use tproxy_common::{ModelClass, ProxyConfig};
use tracing::{debug, warn};

use crate::admission::{AdmissionPermit, priority_for};
use crate::classify::RequestContext;
use crate::core::CoreState;
use crate::error::ProxyError;
use crate::governor::{GovernorError, RequestOutcome};
use crate::headers::upstream_request_headers;
use crate::record::error_snippet;
use crate::retry::{RetryPolicy, Retryable, run_with_retry};
use crate::upstream_client::{ByteStream, UpstreamError, UpstreamRequest, UpstreamResponse};

/// How much of a 429 body is read to describe the failure.
const RATE_LIMIT_BODY_CAP: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("upstream rate limited the request: {detail}")]
    RateLimited { detail: String },
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Governor(#[from] GovernorError),
}

impl Retryable for ForwardError {
    fn is_retryable(&self) -> bool {
        matches!(self, ForwardError::RateLimited { .. })
    }
}

impl ForwardError {
    pub fn into_proxy_error(self, attempts: u32) -> ProxyError {
        match self {
            // The upstream 429 body stays in logs and events only.
            ForwardError::RateLimited { .. } => ProxyError::upstream_unavailable(format!(
                "upstream temporarily unavailable after {attempts} attempt(s), retry later"
            )),
            ForwardError::Upstream(UpstreamError::Timeout(detail)) => {
                ProxyError::gateway_timeout(detail)
            }
            ForwardError::Upstream(UpstreamError::Connect(detail)) => {
                ProxyError::bad_gateway("upstream_connect_failed", detail)
            }
            ForwardError::Upstream(UpstreamError::Transport(detail)) => {
                ProxyError::bad_gateway("upstream_transport_error", detail)
            }
            ForwardError::Timeout(limit) => ProxyError::gateway_timeout(format!(
                "upstream did not answer within {}s",
                limit.as_secs()
            )),
            ForwardError::Governor(GovernorError::Timeout(waited)) => {
                ProxyError::service_unavailable(
                    "governor_timeout",
                    format!("cooldown did not clear within {}s", waited.as_secs()),
                )
            }
            ForwardError::Governor(GovernorError::Aborted) => ProxyError::service_unavailable(
                "governor_aborted",
                "pending request aborted because the upstream stopped",
            ),
        }
    }
}

/// An upstream response whose status and headers have arrived.
///
/// `permit` keeps the admission slot busy until the body has been relayed.
#[derive(Debug)]
pub struct Admitted {
    pub response: UpstreamResponse,
    pub permit: Option<AdmissionPermit>,
    pub deadline: Instant,
}

pub fn upstream_request(ctx: &RequestContext, config: &ProxyConfig) -> UpstreamRequest {
    UpstreamRequest {
        method: ctx.method.clone(),
        url: format!("{}{}", config.upstream_base_url(), ctx.path_and_query),
        headers: upstream_request_headers(&ctx.headers),
        body: ctx.body.clone(),
    }
}

/// Sends the request upstream. Governed requests go through admission,
/// the rate governor and the retry loop; everything else is relayed directly.
///
/// Returns the final result together with the number of attempts made.
pub async fn dispatch(
    state: &CoreState,
    ctx: &RequestContext,
    config: &ProxyConfig,
) -> (Result<Admitted, ForwardError>, u32) {
    let Some(class) = ctx.class else {
        return (forward_direct(state, ctx, config).await, 1);
    };
    let policy = RetryPolicy::from_config(&config.retry);
    let mut shutdown = state.shutdown.subscribe();
    run_with_retry(&policy, &mut shutdown, |attempt| {
        if attempt > 1 {
            debug!(event = "upstream_retry", attempt, class = %class);
        }
        forward_governed(state, ctx, config, class)
    })
    .await
}

async fn forward_governed(
    state: &CoreState,
    ctx: &RequestContext,
    config: &ProxyConfig,
    class: ModelClass,
) -> Result<Admitted, ForwardError> {
    let permit = state.admission.acquire(class, priority_for(class)).await;
    let limit = config.class(class).timeout();
    let deadline = Instant::now() + limit;

    let max_wait = Duration::from_secs(config.governor.max_wait_secs);
    let governor = state.governor.acquire(max_wait).await?;

    let response = match timeout_at(deadline, state.client.send(upstream_request(ctx, config))).await
    {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            governor.end(RequestOutcome::Failed(err.to_string()));
            return Err(err.into());
        }
        Err(_) => {
            governor.end(RequestOutcome::Failed("upstream timeout".to_string()));
            return Err(ForwardError::Timeout(limit));
        }
    };

    if response.status == StatusCode::TOO_MANY_REQUESTS {
        let body = read_capped(response.body, RATE_LIMIT_BODY_CAP, deadline).await;
        governor.end(RequestOutcome::Status(429));
        let detail = error_snippet(&String::from_utf8_lossy(&body));
        warn!(event = "upstream_rate_limited", class = %class, detail = %detail);
        return Err(ForwardError::RateLimited { detail });
    }

    governor.end(RequestOutcome::Status(response.status.as_u16()));
    Ok(Admitted {
        response,
        permit: Some(permit),
        deadline,
    })
}

async fn forward_direct(
    state: &CoreState,
    ctx: &RequestContext,
    config: &ProxyConfig,
) -> Result<Admitted, ForwardError> {
    let limit = config.standard.timeout();
    let deadline = Instant::now() + limit;
    match timeout_at(deadline, state.client.send(upstream_request(ctx, config))).await {
        Ok(Ok(response)) => Ok(Admitted {
            response,
            permit: None,
            deadline,
        }),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(ForwardError::Timeout(limit)),
    }
}

/// Drains a body up to `cap` bytes or until `deadline`, whichever comes first.
pub(crate) async fn read_capped(mut body: ByteStream, cap: usize, deadline: Instant) -> Bytes {
    let mut buf = BytesMut::new();
    while buf.len() < cap {
        match timeout_at(deadline, body.recv()).await {
            Ok(Some(Ok(chunk))) => append_capped(&mut buf, &chunk, cap),
            _ => break,
        }
    }
    buf.freeze()
}

fn append_capped(buf: &mut BytesMut, chunk: &[u8], cap: usize) {
    let room = cap.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
}
