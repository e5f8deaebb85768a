pub mod admission;
pub mod classify;
pub mod core;
pub mod error;
pub mod events;
pub mod forward;
pub mod governor;
pub mod handler;
pub mod headers;
pub mod pump;
pub mod record;
pub mod retry;
pub mod upstream_client;

pub use admission::{AdmissionController, AdmissionPermit, ClassStats};
pub use classify::RequestContext;
pub use crate::core::{Core, CoreState, STATUS_PATH, StatusSnapshot};
pub use error::ProxyError;
pub use events::{Event, EventHub, EventSink, OperationalEvent, RequestEvent, StreamOutcome};
pub use governor::{GovernorError, GovernorSnapshot, RateGovernor, RequestOutcome};
pub use headers::REQUEST_ID_HEADER;
pub use upstream_client::{
    ReqwestUpstreamClient, UpstreamClient, UpstreamClientConfig, UpstreamError,
};
