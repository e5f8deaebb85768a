mod hub;
mod log_sink;
mod types;

pub use hub::{EventHub, EventSink};
pub use log_sink::LogEventSink;
pub use types::{
    CooldownStartedEvent, Event, GovernorResetEvent, OperationalEvent, PendingAbortedEvent,
    RequestEvent, StreamOutcome,
};
