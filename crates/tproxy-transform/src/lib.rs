pub mod preflight;
pub mod rewrite;
pub mod transcode;

pub use preflight::{PreflightFailure, PreflightValidator, PreflightVerdict};
pub use rewrite::{RewritePolicy, RewriteReport, TokenRewrite, TruncationPolicy, rewrite_request};
pub use transcode::{StreamTranscoder, TranscodeError};
