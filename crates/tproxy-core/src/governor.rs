//! Process-wide rate governor.
//!
//! At most one governed request is in its dispatch phase at a time, and after
//! a rate-limit failure every request waits out an exponentially growing
//! cooldown. Any other known outcome clears the cooldown at once; a
//! cancelled request only frees the dispatch slot.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

use crate::events::{
    CooldownStartedEvent, Event, EventHub, GovernorResetEvent, OperationalEvent,
    PendingAbortedEvent,
};

pub const POLL_STEP: Duration = Duration::from_millis(250);
pub const MAX_COOLDOWN: Duration = Duration::from_secs(300);
const MAX_BACKOFF_EXPONENT: u32 = 5;

const RATE_LIMIT_MARKERS: [&str; 4] = ["429", "rate limit", "rate_limit", "too many requests"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Upstream answered with this status.
    Status(u16),
    /// Transport failure, with its error text.
    Failed(String),
    /// The request was dropped before an outcome was known.
    Cancelled,
}

impl RequestOutcome {
    pub fn is_rate_limit(&self) -> bool {
        match self {
            RequestOutcome::Status(status) => *status == 429,
            RequestOutcome::Failed(message) => {
                let message = message.to_ascii_lowercase();
                RATE_LIMIT_MARKERS
                    .iter()
                    .any(|marker| message.contains(marker))
            }
            RequestOutcome::Cancelled => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GovernorError {
    #[error("governor wait aborted")]
    Aborted,
    #[error("governor wait exceeded {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GovernorSnapshot {
    pub enabled: bool,
    pub busy: bool,
    pub consecutive_failures: u32,
    pub cooldown_ms: u64,
    pub remaining_cooldown_ms: u64,
    pub idle_ms: u64,
}

#[derive(Debug)]
struct GovernorState {
    busy: bool,
    last_activity: Instant,
    consecutive_failures: u32,
    cooldown: Duration,
    cooldown_until: Option<Instant>,
}

impl GovernorState {
    fn new() -> Self {
        Self {
            busy: false,
            last_activity: Instant::now(),
            consecutive_failures: 0,
            cooldown: Duration::ZERO,
            cooldown_until: None,
        }
    }

    fn remaining_cooldown(&self, now: Instant) -> Duration {
        self.cooldown_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    fn can_proceed(&self, now: Instant) -> bool {
        !self.busy && self.remaining_cooldown(now).is_zero()
    }
}

pub struct RateGovernor {
    state: Mutex<GovernorState>,
    enabled: AtomicBool,
    base_cooldown_ms: AtomicU64,
    abort: watch::Sender<u64>,
    events: EventHub,
}

impl RateGovernor {
    pub fn new(enabled: bool, base_cooldown: Duration, events: EventHub) -> Self {
        let (abort, _) = watch::channel(0);
        Self {
            state: Mutex::new(GovernorState::new()),
            enabled: AtomicBool::new(enabled),
            base_cooldown_ms: AtomicU64::new(base_cooldown.as_millis() as u64),
            abort,
            events,
        }
    }

    pub fn configure(&self, enabled: bool, base_cooldown: Duration) {
        self.enabled.store(enabled, Ordering::Relaxed);
        self.base_cooldown_ms
            .store(base_cooldown.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn can_proceed(&self) -> bool {
        self.lock().can_proceed(Instant::now())
    }

    /// Marks the governor busy if it is idle and out of cooldown.
    pub fn start_request(&self) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        if !state.can_proceed(now) {
            return false;
        }
        state.busy = true;
        state.last_activity = now;
        true
    }

    pub fn end_request(&self, outcome: RequestOutcome) {
        let now = Instant::now();
        let cooldown_started = {
            let mut state = self.lock();
            state.busy = false;
            state.last_activity = now;
            if outcome.is_rate_limit() {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                let exponent = state.consecutive_failures.min(MAX_BACKOFF_EXPONENT);
                let base = Duration::from_millis(self.base_cooldown_ms.load(Ordering::Relaxed));
                let cooldown = base.saturating_mul(1 << exponent).min(MAX_COOLDOWN);
                state.cooldown = cooldown;
                state.cooldown_until = Some(now + cooldown);
                Some((state.consecutive_failures, cooldown))
            } else if matches!(outcome, RequestOutcome::Cancelled) {
                None
            } else {
                state.consecutive_failures = 0;
                state.cooldown = Duration::ZERO;
                state.cooldown_until = None;
                None
            }
        };

        if let Some((failures, cooldown)) = cooldown_started {
            self.events.emit(Event::Operational(OperationalEvent::CooldownStarted(
                CooldownStartedEvent {
                    at: SystemTime::now(),
                    failures,
                    cooldown_ms: cooldown.as_millis() as u64,
                },
            )));
        }
    }

    /// Waits until a request could start, polling at most every
    /// [`POLL_STEP`].
    pub async fn wait_until_can_proceed(&self, timeout: Duration) -> Result<(), GovernorError> {
        let mut abort = self.abort.subscribe();
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            let remaining = {
                let state = self.lock();
                if state.can_proceed(now) {
                    return Ok(());
                }
                state.remaining_cooldown(now)
            };
            if now >= deadline {
                return Err(GovernorError::Timeout(timeout));
            }
            let step = if remaining.is_zero() {
                POLL_STEP
            } else {
                remaining.min(POLL_STEP)
            };
            let wake = (now + step).min(deadline);
            tokio::select! {
                _ = sleep_until(wake) => {}
                _ = abort.changed() => return Err(GovernorError::Aborted),
            }
        }
    }

    /// Waits for the governor and marks it busy. The returned permit ends the
    /// request exactly once.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<GovernorPermit, GovernorError> {
        if !self.is_enabled() {
            return Ok(GovernorPermit { governor: None });
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.wait_until_can_proceed(remaining).await {
                Ok(()) => {}
                Err(GovernorError::Timeout(_)) => return Err(GovernorError::Timeout(timeout)),
                Err(err) => return Err(err),
            }
            // Another request may have won the race since the wait returned.
            if self.start_request() {
                return Ok(GovernorPermit {
                    governor: Some(self.clone()),
                });
            }
        }
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        let now = Instant::now();
        let state = self.lock();
        GovernorSnapshot {
            enabled: self.is_enabled(),
            busy: state.busy,
            consecutive_failures: state.consecutive_failures,
            cooldown_ms: state.cooldown.as_millis() as u64,
            remaining_cooldown_ms: state.remaining_cooldown(now).as_millis() as u64,
            idle_ms: now.saturating_duration_since(state.last_activity).as_millis() as u64,
        }
    }

    /// Clears failure counters and cooldown. An in-flight request keeps its
    /// busy mark.
    pub fn reset(&self) {
        {
            let mut state = self.lock();
            state.consecutive_failures = 0;
            state.cooldown = Duration::ZERO;
            state.cooldown_until = None;
        }
        self.events
            .emit(Event::Operational(OperationalEvent::GovernorReset(
                GovernorResetEvent {
                    at: SystemTime::now(),
                },
            )));
    }

    /// Fails every outstanding wait with [`GovernorError::Aborted`].
    pub fn abort_pending_requests(&self) {
        self.abort.send_modify(|generation| *generation += 1);
        self.events
            .emit(Event::Operational(OperationalEvent::PendingAborted(
                PendingAbortedEvent {
                    at: SystemTime::now(),
                },
            )));
    }
}

pub struct GovernorPermit {
    governor: Option<Arc<RateGovernor>>,
}

impl GovernorPermit {
    pub fn end(mut self, outcome: RequestOutcome) {
        if let Some(governor) = self.governor.take() {
            governor.end_request(outcome);
        }
    }
}

impl Drop for GovernorPermit {
    fn drop(&mut self) {
        if let Some(governor) = self.governor.take() {
            governor.end_request(RequestOutcome::Cancelled);
        }
    }
}
