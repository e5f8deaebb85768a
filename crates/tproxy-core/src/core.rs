use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tproxy_common::{ModelClass, ProxyConfig, TranscodeMode};
use tracing::info;

use crate::admission::{AdmissionController, ClassStats};
use crate::events::{EventHub, LogEventSink};
use crate::governor::{GovernorSnapshot, RateGovernor};
use crate::handler::proxy_handler;
use crate::upstream_client::UpstreamClient;

pub const STATUS_PATH: &str = "/__tproxy/status";

pub struct CoreState {
    pub config: ArcSwap<ProxyConfig>,
    pub client: Arc<dyn UpstreamClient>,
    pub governor: Arc<RateGovernor>,
    pub admission: Arc<AdmissionController>,
    pub events: EventHub,
    pub diagnostics: Arc<AtomicBool>,
    pub shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Core {
    state: Arc<CoreState>,
}

impl Core {
    pub fn new(config: ProxyConfig, client: Arc<dyn UpstreamClient>) -> Self {
        let events = EventHub::default();
        let diagnostics = Arc::new(AtomicBool::new(config.diagnostics));
        events.add_sink(Arc::new(LogEventSink::new(diagnostics.clone())));

        let governor = Arc::new(RateGovernor::new(
            config.governor.enabled,
            Duration::from_millis(config.governor.base_cooldown_ms),
            events.clone(),
        ));
        let admission = Arc::new(AdmissionController::new(
            config.thinking.max_concurrency,
            config.standard.max_concurrency,
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            state: Arc::new(CoreState {
                config: ArcSwap::from_pointee(config),
                client,
                governor,
                admission,
                events,
                diagnostics,
                shutdown,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(STATUS_PATH, get(status_handler))
            .fallback(proxy_handler)
            .with_state(self.state.clone())
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }

    pub fn events(&self) -> EventHub {
        self.state.events.clone()
    }

    pub fn config(&self) -> Arc<ProxyConfig> {
        self.state.config.load_full()
    }

    /// Swaps in a new configuration. Requests already in flight keep the
    /// snapshot they started with; concurrency bounds apply immediately.
    pub fn update_config(&self, config: ProxyConfig) {
        let state = &self.state;
        for class in ModelClass::ALL {
            state
                .admission
                .set_max_concurrency(class, config.class(class).max_concurrency);
        }
        state.governor.configure(
            config.governor.enabled,
            Duration::from_millis(config.governor.base_cooldown_ms),
        );
        state
            .diagnostics
            .store(config.diagnostics, Ordering::Relaxed);
        info!(
            event = "config_updated",
            enabled = config.enabled,
            transcode = %config.transcode,
            diagnostics = config.diagnostics
        );
        state.config.store(Arc::new(config));
    }

    /// Called when the upstream process stops: nothing queued behind the
    /// governor can succeed, and stale cooldown must not outlive it.
    pub fn upstream_stopped(&self) {
        self.state.governor.abort_pending_requests();
        self.state.governor.reset();
    }

    /// Interrupts retry backoff and pending governor waits.
    pub fn shutdown(&self) {
        self.state.shutdown.send_replace(true);
        self.state.governor.abort_pending_requests();
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot::collect(&self.state)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub enabled: bool,
    pub transcode: TranscodeMode,
    pub governor: GovernorSnapshot,
    pub admission: Vec<ClassStats>,
}

impl StatusSnapshot {
    fn collect(state: &CoreState) -> Self {
        let config = state.config.load();
        Self {
            enabled: config.enabled,
            transcode: config.transcode,
            governor: state.governor.snapshot(),
            admission: state.admission.all_stats(),
        }
    }
}

async fn status_handler(State(state): State<Arc<CoreState>>) -> Json<StatusSnapshot> {
    Json(StatusSnapshot::collect(&state))
}
