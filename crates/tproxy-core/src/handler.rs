use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::HeaderMap;
use http::header::CONTENT_LENGTH;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tproxy_common::ProxyConfig;
use tproxy_transform::StreamTranscoder;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::RequestContext;
use crate::core::CoreState;
use crate::error::ProxyError;
use crate::events::Event;
use crate::forward::{Admitted, dispatch};
use crate::headers::{
    downstream_response_headers, insert_request_id, is_event_stream, mark_event_stream,
};
use crate::pump::{PumpJob, preflight_stream, spawn_pump};
use crate::record::{RequestRecord, error_snippet};
use crate::upstream_client::UpstreamResponse;

pub async fn proxy_handler(State(state): State<Arc<CoreState>>, request: Request) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let started_at = Instant::now();
    let config = state.config.load_full();

    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let record = RequestRecord::new(
        trace_id.clone(),
        parts.method.to_string(),
        path.clone(),
        started_at,
    );

    let body = match read_body(&parts.headers, body, config.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => return respond_error(&state, record, err),
    };

    let ctx = RequestContext::build(
        parts.method,
        path,
        path_and_query,
        parts.headers,
        body,
        &config,
    );
    info!(
        event = "downstream_received",
        trace_id = %trace_id,
        method = %ctx.method,
        path = %ctx.path,
        model = ?ctx.model,
        class = ?ctx.class,
        is_stream = ctx.wants_stream(),
        token_rewrites = ctx.rewrite.token_rewrites.len(),
        truncated_messages = ctx.rewrite.truncated_messages
    );
    let mut record = record.with_context(&ctx);

    let (result, attempts) = dispatch(&state, &ctx, &config).await;
    record.attempts = attempts;
    match result {
        Ok(admitted) => respond(&state, &ctx, &config, admitted, record).await,
        Err(err) => {
            record.upstream_error = Some(error_snippet(&err.to_string()));
            respond_error(&state, record, err.into_proxy_error(attempts))
        }
    }
}

async fn respond(
    state: &CoreState,
    ctx: &RequestContext,
    config: &ProxyConfig,
    admitted: Admitted,
    mut record: RequestRecord,
) -> Response {
    let Admitted {
        response,
        permit,
        deadline,
    } = admitted;
    let UpstreamResponse {
        status,
        headers,
        mut body,
    } = response;
    record.status = status.as_u16();

    let event_stream = is_event_stream(&headers);
    let governed_stream = ctx.is_governed() && status.is_success() && event_stream;

    let mut prefix = None;
    if governed_stream {
        match preflight_stream(&mut body, deadline).await {
            Ok(bytes) => prefix = Some(bytes),
            Err(err) => {
                drop(body);
                drop(permit);
                record.upstream_error = Some(err.to_string());
                return respond_error(state, record, err.into_proxy_error());
            }
        }
    }

    let transcoder = if governed_stream {
        StreamTranscoder::new(config.transcode)
    } else {
        None
    };
    if transcoder.is_some() {
        record.transcode = Some(config.transcode);
    }

    let mut out_headers = downstream_response_headers(&headers, transcoder.is_some());
    if event_stream {
        mark_event_stream(&mut out_headers);
    }
    insert_request_id(&mut out_headers, &record.trace_id);
    info!(
        event = "downstream_responded",
        trace_id = %record.trace_id,
        status = record.status,
        attempts = record.attempts,
        elapsed_ms = record.elapsed_ms(),
        is_stream = event_stream,
        transcode = ?record.transcode
    );

    let rx = spawn_pump(PumpJob {
        upstream: body,
        prefix,
        transcoder,
        deadline: ctx.is_governed().then_some(deadline),
        permit,
        record,
        events: state.events.clone(),
    });
    let mut resp = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    *resp.status_mut() = status;
    *resp.headers_mut() = out_headers;
    resp
}

fn respond_error(state: &CoreState, mut record: RequestRecord, err: ProxyError) -> Response {
    record.status = err.status.as_u16();
    warn!(
        event = "downstream_responded",
        trace_id = %record.trace_id,
        status = record.status,
        attempts = record.attempts,
        error_body = %String::from_utf8_lossy(&err.body),
        elapsed_ms = record.elapsed_ms()
    );
    let trace_id = record.trace_id.clone();
    let response_bytes = err.body.len() as u64;
    state
        .events
        .emit(Event::Request(record.finish(None, response_bytes)));

    let mut resp = err.into_response();
    insert_request_id(resp.headers_mut(), &trace_id);
    resp
}

/// Buffers the client body, refusing anything above `limit` bytes. A declared
/// `content-length` is checked before reading.
async fn read_body(headers: &HeaderMap, body: Body, limit: usize) -> Result<Bytes, ProxyError> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Err(ProxyError::payload_too_large(limit));
    }

    let mut buf = BytesMut::new();
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| ProxyError::bad_request(err.to_string()))?;
        if buf.len() + chunk.len() > limit {
            return Err(ProxyError::payload_too_large(limit));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}
