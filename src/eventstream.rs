//! `application/vnd.amazon.eventstream` bodies of `InvokeModelWithResponseStream`.
//!
//! Framing and checksums are handled by [`aws_event_stream_parser::EventStreamCodec`];
//! this module only gives the decoded frames their Bedrock meaning.

use aws_event_stream_parser::{EventStreamCodec, HeaderValue, Message};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use tokio_util::codec::Decoder;

use crate::upstream::{ChunkStream, Operation, UpstreamError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventStreamError {
    #[error("invalid frame: {0}")]
    Frame(String),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("stream ended inside a message ({0} bytes buffered)")]
    Truncated(usize),
    #[error("invalid chunk payload: {0}")]
    InvalidChunk(String),
}

impl From<EventStreamError> for UpstreamError {
    fn from(err: EventStreamError) -> Self {
        UpstreamError::Decode(err.to_string())
    }
}

fn header_str<'a>(msg: &'a Message, name: &str) -> Option<&'a str> {
    msg.headers
        .headers
        .iter()
        .find(|h| h.key.as_str() == name)
        .and_then(|h| match &h.value {
            HeaderValue::String(s) => Some(s.as_str()),
            _ => None,
        })
}

/// What a decoded frame means for the invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// JSON document of one model event.
    Chunk(Bytes),
    Exception { code: String, message: String },
    /// Frames with an event type this proxy does not consume.
    Ignored(String),
}

#[derive(Deserialize)]
struct ChunkPayload {
    bytes: String,
}

#[derive(Deserialize)]
struct ExceptionPayload {
    #[serde(default, alias = "Message")]
    message: Option<String>,
}

impl UpstreamEvent {
    pub fn from_message(msg: &Message) -> Result<Self, EventStreamError> {
        let payload: &[u8] = &msg.body;
        match header_str(msg, ":message-type").unwrap_or("event") {
            "event" => {
                let event_type = header_str(msg, ":event-type").unwrap_or_default();
                if event_type != "chunk" {
                    return Ok(UpstreamEvent::Ignored(event_type.to_string()));
                }
                let chunk: ChunkPayload = serde_json::from_slice(payload)
                    .map_err(|err| EventStreamError::InvalidChunk(err.to_string()))?;
                let decoded = BASE64
                    .decode(chunk.bytes.as_bytes())
                    .map_err(|err| EventStreamError::InvalidChunk(err.to_string()))?;
                Ok(UpstreamEvent::Chunk(Bytes::from(decoded)))
            }
            "exception" => {
                let code = header_str(msg, ":exception-type").unwrap_or("InternalServerException");
                let message = serde_json::from_slice::<ExceptionPayload>(payload)
                    .ok()
                    .and_then(|p| p.message)
                    .unwrap_or_else(|| String::from_utf8_lossy(payload).into_owned());
                Ok(UpstreamEvent::Exception {
                    code: exception_code(code),
                    message,
                })
            }
            "error" => Ok(UpstreamEvent::Exception {
                code: exception_code(header_str(msg, ":error-code").unwrap_or("InternalServerException")),
                message: header_str(msg, ":error-message").unwrap_or_default().to_string(),
            }),
            other => Err(EventStreamError::InvalidHeader(format!(
                ":message-type: unexpected value {other}"
            ))),
        }
    }
}

/// Stream exceptions arrive in camelCase (`throttlingException`).
fn exception_code(raw: &str) -> String {
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

fn exception_status(code: &str) -> u16 {
    match code {
        "ValidationException" => 400,
        "AccessDeniedException" => 403,
        "ResourceNotFoundException" => 404,
        "ModelTimeoutException" => 408,
        "ThrottlingException" | "TooManyRequestsException" => 429,
        "ServiceUnavailableException" | "ModelNotReadyException" => 503,
        _ => 500,
    }
}

struct DecodeState<S> {
    body: S,
    codec: EventStreamCodec,
    buf: BytesMut,
    ready: VecDeque<Result<Bytes, UpstreamError>>,
    done: bool,
}

/// Turns a raw response body into the stream of decoded model chunks.
///
/// The first error ends the stream; nothing after it is yielded.
pub fn decode_chunks<S>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<Bytes, UpstreamError>> + Send + Unpin + 'static,
{
    let state = DecodeState {
        body,
        codec: EventStreamCodec,
        buf: BytesMut::new(),
        ready: VecDeque::new(),
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                if item.is_err() {
                    state.ready.clear();
                    state.done = true;
                }
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(data)) => {
                    state.buf.extend_from_slice(&data);
                    drain(&mut state);
                }
                Some(Err(err)) => {
                    state.done = true;
                    return Some((Err(err), state));
                }
                None => {
                    state.done = true;
                    if !state.buf.is_empty() {
                        let err = EventStreamError::Truncated(state.buf.len());
                        return Some((Err(err.into()), state));
                    }
                }
            }
        }
    })
    .boxed()
}

fn drain<S>(state: &mut DecodeState<S>) {
    loop {
        let msg = match state.codec.decode(&mut state.buf) {
            Ok(Some(msg)) => msg,
            Ok(None) => return,
            Err(err) => {
                let err = EventStreamError::Frame(format!("{err:?}"));
                state.ready.push_back(Err(err.into()));
                return;
            }
        };
        match UpstreamEvent::from_message(&msg) {
            Ok(UpstreamEvent::Chunk(json)) => state.ready.push_back(Ok(json)),
            Ok(UpstreamEvent::Exception { code, message }) => {
                let status = exception_status(&code);
                state.ready.push_back(Err(UpstreamError::api(
                    Operation::InvokeModelWithResponseStream,
                    status,
                    code,
                    message,
                )));
                return;
            }
            Ok(UpstreamEvent::Ignored(event_type)) => {
                tracing::debug!(event_type = %event_type, "ignoring event-stream frame");
            }
            Err(err) => {
                state.ready.push_back(Err(err.into()));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_case_exception_types_are_normalized() {
        assert_eq!(exception_code("throttlingException"), "ThrottlingException");
        assert_eq!(exception_code("ModelStreamErrorException"), "ModelStreamErrorException");
        assert_eq!(exception_code(""), "");
    }

    #[test]
    fn exception_status_follows_bedrock_codes() {
        assert_eq!(exception_status("ThrottlingException"), 429);
        assert_eq!(exception_status("ValidationException"), 400);
        assert_eq!(exception_status("ModelStreamErrorException"), 500);
    }
}
