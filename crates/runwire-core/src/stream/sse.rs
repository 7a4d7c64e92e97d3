use std::pin::Pin;
use std::task::{Context, Poll};

use eventsource_stream::{EventStream, EventStreamError, Eventsource};
use futures_util::Stream;
use serde::Deserialize;

/// Events carried on the run stream.
///
/// Sequence numbers are not guaranteed to arrive in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// A chunk of assistant content.
    Delta {
        seq: u64,
        text: String,
        message_id: Option<String>,
    },
    /// The run finished successfully.
    Done {
        seq: Option<u64>,
        message_id: Option<String>,
        conversation_id: Option<String>,
    },
    /// The backend reported a run failure.
    Error {
        seq: Option<u64>,
        code: String,
        message: String,
    },
    /// Keepalive.
    Ping,
    /// An event type this client does not handle.
    Ignored { event: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// The connection failed mid-stream.
    Transport,
    /// An event could not be decoded.
    Parse,
}

/// Failure while reading the run stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
}

impl StreamError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self {
            kind: StreamErrorKind::Parse,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: StreamErrorKind::Transport,
            message: message.into(),
        }
    }

    /// Code recorded on the run when the stream fails with this error.
    pub fn code(&self) -> &'static str {
        match self.kind {
            StreamErrorKind::Transport => "E_STREAM",
            StreamErrorKind::Parse => "E_STREAM_PARSE",
        }
    }
}

/// SSE parser that converts a byte stream into `RunEvent`s.
pub struct SseParser<S> {
    inner: EventStream<S>,
}

impl<S> SseParser<S> {
    pub fn new(stream: S) -> Self
    where
        S: Eventsource,
    {
        Self {
            inner: stream.eventsource(),
        }
    }
}

impl<S, E> Stream for SseParser<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = Result<RunEvent, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => {
                Poll::Ready(Some(parse_sse_event_fields(&event.event, &event.data)))
            }
            Poll::Ready(Some(Err(EventStreamError::Transport(e)))) => Poll::Ready(Some(Err(
                StreamError::transport(format!("SSE connection error: {e}")),
            ))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(StreamError::parse(format!(
                "SSE stream error: {e}"
            ))))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn parse_data<'a, T: Deserialize<'a>>(event_type: &str, data: &'a str) -> Result<T, StreamError> {
    if data.trim().is_empty() {
        return Err(StreamError::parse(format!("Missing data for {event_type}")));
    }
    serde_json::from_str(data)
        .map_err(|err| StreamError::parse(format!("Failed to parse {event_type}: {err}")))
}

/// Parses one SSE event (type and data) into a `RunEvent`.
///
/// # Errors
/// Returns a parse error if a known event carries malformed data.
pub fn parse_sse_event_fields(event_type: &str, data: &str) -> Result<RunEvent, StreamError> {
    match event_type {
        "ping" => Ok(RunEvent::Ping),
        "delta" => {
            let parsed: SseDelta = parse_data(event_type, data)?;
            Ok(RunEvent::Delta {
                seq: parsed.seq,
                text: parsed.delta,
                message_id: parsed.message_id,
            })
        }
        "done" => {
            // `done` may legitimately arrive with an empty payload.
            let parsed: SseDone = if data.trim().is_empty() {
                SseDone::default()
            } else {
                parse_data(event_type, data)?
            };
            Ok(RunEvent::Done {
                seq: parsed.seq,
                message_id: parsed.message_id,
                conversation_id: parsed.conversation_id,
            })
        }
        "error" => {
            let parsed: SseError = parse_data(event_type, data)?;
            Ok(RunEvent::Error {
                seq: parsed.seq,
                code: parsed.code,
                message: parsed.message,
            })
        }
        other => Ok(RunEvent::Ignored {
            event: other.to_string(),
        }),
    }
}

// === SSE payloads ===

#[derive(Debug, Deserialize)]
struct SseDelta {
    seq: u64,
    #[serde(alias = "text")]
    delta: String,
    #[serde(default)]
    message_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SseDone {
    #[serde(default)]
    seq: Option<u64>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseError {
    #[serde(default)]
    seq: Option<u64>,
    code: String,
    #[serde(default)]
    message: String,
}
