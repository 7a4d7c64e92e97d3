//! Run submission and SSE consumption.

mod adapter;
pub mod sse;

pub use adapter::{ChatClient, ChatError, STREAM_TIMEOUT_CODE};
pub use sse::{RunEvent, SseParser, StreamError, StreamErrorKind};
