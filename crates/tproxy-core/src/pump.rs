use std::io;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout_at};
use tproxy_transform::{PreflightFailure, PreflightValidator, PreflightVerdict, StreamTranscoder};
use tracing::{info, warn};

use crate::admission::AdmissionPermit;
use crate::error::ProxyError;
use crate::events::{Event, EventHub, StreamOutcome};
use crate::record::{RequestRecord, error_snippet};
use crate::upstream_client::{ByteStream, UpstreamError};

const DOWNSTREAM_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error(transparent)]
    Invalid(#[from] PreflightFailure),
    #[error("upstream stream did not produce a first event in time")]
    Timeout,
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl PreflightError {
    pub fn into_proxy_error(self) -> ProxyError {
        match self {
            PreflightError::Invalid(failure) => {
                ProxyError::bad_gateway("upstream_malformed_stream", failure.to_string())
            }
            PreflightError::Timeout => ProxyError::gateway_timeout(self.to_string()),
            PreflightError::Upstream(err) => {
                ProxyError::bad_gateway("upstream_stream_failed", err.to_string())
            }
        }
    }
}

/// Reads the head of an SSE body until it is known to carry real output.
/// The consumed bytes are returned so they can be replayed to the client.
pub async fn preflight_stream(
    body: &mut ByteStream,
    deadline: Instant,
) -> Result<Bytes, PreflightError> {
    let mut validator = PreflightValidator::default();
    loop {
        let verdict = match timeout_at(deadline, body.recv()).await {
            Ok(Some(Ok(chunk))) => validator.push(&chunk),
            Ok(Some(Err(err))) => return Err(err.into()),
            Ok(None) => validator.finish(),
            Err(_) => return Err(PreflightError::Timeout),
        };
        match verdict {
            PreflightVerdict::Pending => continue,
            PreflightVerdict::Valid => return Ok(validator.into_prefix()),
            PreflightVerdict::Invalid(failure) => return Err(failure.into()),
        }
    }
}

/// Everything the body pump owns for the lifetime of one response.
pub struct PumpJob {
    pub upstream: ByteStream,
    /// Bytes already consumed by preflight.
    pub prefix: Option<Bytes>,
    pub transcoder: Option<StreamTranscoder>,
    /// Only governed requests carry one.
    pub deadline: Option<Instant>,
    pub permit: Option<AdmissionPermit>,
    pub record: RequestRecord,
    pub events: EventHub,
}

/// Body chunks handed to the downstream response. An `Err` makes the server
/// abort the connection instead of ending the body cleanly.
pub type DownstreamChunk = Result<Bytes, io::Error>;

/// Spawns the task relaying upstream bytes to the client. The admission slot
/// is released and the request event emitted once the task ends.
pub fn spawn_pump(job: PumpJob) -> mpsc::Receiver<DownstreamChunk> {
    let (tx, rx) = mpsc::channel::<DownstreamChunk>(DOWNSTREAM_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let PumpJob {
            upstream,
            prefix,
            transcoder,
            deadline,
            permit,
            mut record,
            events,
        } = job;
        let mut relay = Relay {
            upstream,
            transcoder,
            tx,
            sent: 0,
            error: None,
        };
        let outcome = relay.run(prefix, deadline).await;
        drop(relay.upstream);
        drop(permit);

        if record.upstream_error.is_none() {
            record.upstream_error = relay.error;
        }
        match outcome {
            StreamOutcome::Completed => info!(
                event = "downstream_completed",
                trace_id = %record.trace_id,
                status = record.status,
                bytes = relay.sent,
                elapsed_ms = record.elapsed_ms()
            ),
            _ => warn!(
                event = "downstream_aborted",
                trace_id = %record.trace_id,
                status = record.status,
                outcome = outcome.as_str(),
                bytes = relay.sent,
                elapsed_ms = record.elapsed_ms()
            ),
        }
        events.emit(Event::Request(record.finish(Some(outcome), relay.sent)));

        if let Some(reason) = abort_reason(outcome) {
            let _ = relay.tx.send(Err(io::Error::other(reason))).await;
        }
    });
    rx
}

struct Relay {
    upstream: ByteStream,
    transcoder: Option<StreamTranscoder>,
    tx: mpsc::Sender<DownstreamChunk>,
    sent: u64,
    error: Option<String>,
}

impl Relay {
    async fn run(&mut self, prefix: Option<Bytes>, deadline: Option<Instant>) -> StreamOutcome {
        if let Some(prefix) = prefix {
            if let Err(outcome) = self.forward(prefix).await {
                return outcome;
            }
        }
        loop {
            let item = tokio::select! {
                _ = deadline_elapsed(deadline) => return StreamOutcome::TimedOut,
                _ = self.tx.closed() => return StreamOutcome::ClientDisconnected,
                item = self.upstream.recv() => item,
            };
            match item {
                Some(Ok(chunk)) => {
                    if let Err(outcome) = self.forward(chunk).await {
                        return outcome;
                    }
                }
                Some(Err(err)) => {
                    self.error = Some(error_snippet(&err.to_string()));
                    return StreamOutcome::UpstreamError;
                }
                None => return self.flush().await,
            }
        }
    }

    async fn forward(&mut self, chunk: Bytes) -> Result<(), StreamOutcome> {
        let out = match self.transcoder.as_mut() {
            Some(transcoder) => match transcoder.push(&chunk) {
                Ok(out) => out,
                Err(err) => {
                    self.error = Some(error_snippet(&err.to_string()));
                    return Err(StreamOutcome::TranscoderFault);
                }
            },
            None => vec![chunk],
        };
        self.send_all(out).await
    }

    async fn flush(&mut self) -> StreamOutcome {
        let Some(transcoder) = self.transcoder.as_mut() else {
            return StreamOutcome::Completed;
        };
        let tail = match transcoder.finish() {
            Ok(tail) => tail,
            Err(err) => {
                self.error = Some(error_snippet(&err.to_string()));
                return StreamOutcome::TranscoderFault;
            }
        };
        match self.send_all(tail).await {
            Ok(()) => StreamOutcome::Completed,
            Err(outcome) => outcome,
        }
    }

    async fn send_all(&mut self, chunks: Vec<Bytes>) -> Result<(), StreamOutcome> {
        for chunk in chunks {
            if chunk.is_empty() {
                continue;
            }
            let len = chunk.len() as u64;
            self.tx
                .send(Ok(chunk))
                .await
                .map_err(|_| StreamOutcome::ClientDisconnected)?;
            self.sent += len;
        }
        Ok(())
    }
}

/// A body cut short by the upstream must not look complete to the client.
/// Transcoder faults still end the body cleanly.
fn abort_reason(outcome: StreamOutcome) -> Option<&'static str> {
    match outcome {
        StreamOutcome::TimedOut => Some("upstream stream exceeded its deadline"),
        StreamOutcome::UpstreamError => Some("upstream stream failed"),
        StreamOutcome::Completed
        | StreamOutcome::ClientDisconnected
        | StreamOutcome::TranscoderFault => None,
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::broadcast::error::TryRecvError;
    use tproxy_common::{ModelClass, TranscodeMode};

    use super::*;
    use crate::admission::AdmissionController;

    fn upstream(chunks: &[&'static [u8]]) -> ByteStream {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            tx.try_send(Ok(Bytes::from_static(chunk))).unwrap();
        }
        rx
    }

    fn record() -> RequestRecord {
        RequestRecord::new(
            "trace".to_string(),
            "POST".to_string(),
            "/v1/chat/completions".to_string(),
            Instant::now(),
        )
    }

    /// Drains the body, returning the bytes and the abort error if one ended it.
    async fn collect(mut rx: mpsc::Receiver<DownstreamChunk>) -> (Vec<u8>, Option<io::Error>) {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            match chunk {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(err) => return (out, Some(err)),
            }
        }
        (out, None)
    }

    #[tokio::test]
    async fn preflight_accepts_content_and_keeps_prefix() {
        let mut body = upstream(&[b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n"]);
        let prefix = preflight_stream(&mut body, Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
        assert!(prefix.starts_with(b"data: "));
    }

    #[tokio::test]
    async fn preflight_rejects_empty_choices() {
        let mut body = upstream(&[b"data: {\"choices\":[]}\n\n"]);
        let err = preflight_stream(&mut body, Instant::now() + Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PreflightError::Invalid(PreflightFailure::NoChoices)
        ));
        assert_eq!(err.into_proxy_error().status.as_u16(), 502);
    }

    #[tokio::test(start_paused = true)]
    async fn preflight_times_out_on_silent_upstream() {
        let (_tx, mut body) = mpsc::channel::<Result<Bytes, UpstreamError>>(1);
        let err = preflight_stream(&mut body, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PreflightError::Timeout));
    }

    #[tokio::test]
    async fn pump_relays_prefix_then_rest_and_emits_event() {
        let events = EventHub::default();
        let mut rx_events = events.subscribe();
        let job = PumpJob {
            upstream: upstream(&[b"second"]),
            prefix: Some(Bytes::from_static(b"first,")),
            transcoder: None,
            deadline: None,
            permit: None,
            record: record(),
            events,
        };
        let (body, aborted) = collect(spawn_pump(job)).await;
        assert_eq!(body, b"first,second");
        assert!(aborted.is_none());

        let event = rx_events.recv().await.unwrap();
        let Event::Request(event) = event else {
            panic!("expected request event");
        };
        assert_eq!(event.stream_outcome, Some(StreamOutcome::Completed));
        assert_eq!(event.response_bytes, 12);
    }

    #[tokio::test]
    async fn pump_flushes_transcoder_at_end_of_stream() {
        let events = EventHub::default();
        let job = PumpJob {
            upstream: upstream(&[
                b"data: {\"id\":\"c\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\n",
            ]),
            prefix: None,
            transcoder: StreamTranscoder::new(TranscodeMode::Claude),
            deadline: None,
            permit: None,
            record: record(),
            events,
        };
        let (body, aborted) = collect(spawn_pump(job)).await;
        assert!(aborted.is_none());
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains("event: message_start"));
        assert!(body.contains("event: message_stop"));
    }

    #[tokio::test(start_paused = true)]
    async fn pump_stops_at_deadline() {
        let events = EventHub::default();
        let mut rx_events = events.subscribe();
        let (_tx, upstream) = mpsc::channel::<Result<Bytes, UpstreamError>>(1);
        let job = PumpJob {
            upstream,
            prefix: None,
            transcoder: None,
            deadline: Some(Instant::now() + Duration::from_secs(2)),
            permit: None,
            record: record(),
            events,
        };
        let (body, aborted) = collect(spawn_pump(job)).await;
        assert!(body.is_empty());
        assert!(aborted.is_some());
        let Event::Request(event) = rx_events.recv().await.unwrap() else {
            panic!("expected request event");
        };
        assert_eq!(event.stream_outcome, Some(StreamOutcome::TimedOut));
        assert!(matches!(rx_events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn pump_releases_admission_slot_at_deadline_mid_stream() {
        let admission = Arc::new(AdmissionController::new(1, 1));
        let permit = admission.acquire(ModelClass::Standard, 0).await;
        assert_eq!(admission.stats(ModelClass::Standard).running, 1);

        let events = EventHub::default();
        let mut rx_events = events.subscribe();
        let (upstream_tx, upstream) = mpsc::channel::<Result<Bytes, UpstreamError>>(4);
        upstream_tx
            .send(Ok(Bytes::from_static(b"data: partial\n\n")))
            .await
            .unwrap();
        let job = PumpJob {
            upstream,
            prefix: None,
            transcoder: None,
            deadline: Some(Instant::now() + Duration::from_secs(2)),
            permit: Some(permit),
            record: record(),
            events,
        };
        let (body, aborted) = collect(spawn_pump(job)).await;
        assert_eq!(body, b"data: partial\n\n");
        assert!(aborted.is_some());

        let Event::Request(event) = rx_events.recv().await.unwrap() else {
            panic!("expected request event");
        };
        assert_eq!(event.stream_outcome, Some(StreamOutcome::TimedOut));
        assert_eq!(admission.stats(ModelClass::Standard).running, 0);
        drop(upstream_tx);
    }

    #[tokio::test]
    async fn pump_aborts_body_on_upstream_error() {
        let events = EventHub::default();
        let (tx, upstream) = mpsc::channel::<Result<Bytes, UpstreamError>>(4);
        tx.send(Ok(Bytes::from_static(b"data: a\n\n"))).await.unwrap();
        tx.send(Err(UpstreamError::Transport("connection reset".into())))
            .await
            .unwrap();
        drop(tx);
        let job = PumpJob {
            upstream,
            prefix: None,
            transcoder: None,
            deadline: None,
            permit: None,
            record: record(),
            events: events.clone(),
        };
        let mut rx_events = events.subscribe();
        let (body, aborted) = collect(spawn_pump(job)).await;
        assert_eq!(body, b"data: a\n\n");
        assert!(aborted.is_some());
        let Event::Request(event) = rx_events.recv().await.unwrap() else {
            panic!("expected request event");
        };
        assert_eq!(event.stream_outcome, Some(StreamOutcome::UpstreamError));
        assert!(event.upstream_error.unwrap().contains("connection reset"));
    }
}
