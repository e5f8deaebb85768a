pub mod claude;
pub mod openai;
pub mod sse;

pub use sse::{SseFrame, SseParser};
