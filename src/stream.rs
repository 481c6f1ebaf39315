//! Re-framing of upstream model chunks into the public SSE event sequence.

use axum::response::sse::Event;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::collections::BTreeSet;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::anthropic::{
    BlockDelta, CompletionResponse, ContentBlock, MessagesResponse, Passthrough, Role,
    StreamErrorBody, StreamEvent, Usage,
};
use crate::error::AppError;
use crate::translate::{classify, completion_id, message_id};
use crate::upstream::{ChunkStream, UpstreamError};

const CHANNEL_CAPACITY: usize = 64;

/// Ordering state of one streamed message.
///
/// Guarantees a single leading `message_start`, deltas only inside an open block,
/// a stop for every started block, and `message_stop` (or one `error`) as the
/// final event.
#[derive(Debug)]
pub struct Multiplexer {
    requested_model: String,
    started: bool,
    finished: bool,
    open_blocks: BTreeSet<u32>,
    seen_blocks: BTreeSet<u32>,
}

impl Multiplexer {
    pub fn new(requested_model: impl Into<String>) -> Self {
        Self {
            requested_model: requested_model.into(),
            started: false,
            finished: false,
            open_blocks: BTreeSet::new(),
            seen_blocks: BTreeSet::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Parses one upstream chunk. Event types this proxy does not know are skipped.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>, UpstreamError> {
        let value: Value = serde_json::from_slice(chunk)
            .map_err(|err| UpstreamError::Decode(format!("invalid stream chunk: {err}")))?;
        let event_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match serde_json::from_value::<StreamEvent>(value) {
            Ok(event) => Ok(self.push(event)),
            Err(err) if is_known_event(&event_type) => Err(UpstreamError::Decode(format!(
                "invalid {event_type} event: {err}"
            ))),
            Err(_) => {
                tracing::debug!(event_type = %event_type, "skipping unknown stream event");
                Ok(Vec::new())
            }
        }
    }

    pub fn push(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        match event {
            StreamEvent::MessageStart { mut message } => {
                if self.started {
                    return out;
                }
                self.started = true;
                message.model = self.requested_model.clone();
                out.push(StreamEvent::MessageStart { message });
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                self.ensure_started(&mut out);
                if self.seen_blocks.insert(index) {
                    self.open_blocks.insert(index);
                    out.push(StreamEvent::ContentBlockStart {
                        index,
                        content_block,
                    });
                }
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                self.ensure_started(&mut out);
                if !self.open_blocks.contains(&index) {
                    let Some(block) = self.implicit_block(index, &delta) else {
                        tracing::debug!(index, "dropping delta outside an open block");
                        return out;
                    };
                    self.seen_blocks.insert(index);
                    self.open_blocks.insert(index);
                    out.push(StreamEvent::ContentBlockStart {
                        index,
                        content_block: block,
                    });
                }
                out.push(StreamEvent::ContentBlockDelta { index, delta });
            }
            StreamEvent::ContentBlockStop { index } => {
                if self.open_blocks.remove(&index) {
                    out.push(StreamEvent::ContentBlockStop { index });
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                self.ensure_started(&mut out);
                self.close_blocks(&mut out);
                out.push(StreamEvent::MessageDelta { delta, usage });
            }
            StreamEvent::MessageStop => {
                self.ensure_started(&mut out);
                self.close_blocks(&mut out);
                out.push(StreamEvent::MessageStop);
                self.finished = true;
            }
            StreamEvent::Ping => out.push(StreamEvent::Ping),
            StreamEvent::Error { error } => {
                out.push(StreamEvent::Error { error });
                self.finished = true;
            }
        }
        out
    }

    /// Upstream ended cleanly: close whatever is still open.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.ensure_started(&mut out);
        self.close_blocks(&mut out);
        out.push(StreamEvent::MessageStop);
        self.finished = true;
        out
    }

    /// Ends the stream with a single `error` event.
    pub fn fail(&mut self, err: &AppError) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![error_event(err)]
    }

    fn ensure_started(&mut self, out: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(StreamEvent::MessageStart {
            message: MessagesResponse {
                id: message_id(),
                response_type: "message".to_string(),
                role: Role::Assistant,
                content: Vec::new(),
                model: self.requested_model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
                extra: Default::default(),
            },
        });
    }

    fn close_blocks(&mut self, out: &mut Vec<StreamEvent>) {
        for index in std::mem::take(&mut self.open_blocks) {
            out.push(StreamEvent::ContentBlockStop { index });
        }
    }

    /// A start block for a delta whose block was never opened. Blocks that were already
    /// stopped are not reopened.
    fn implicit_block(&self, index: u32, delta: &BlockDelta) -> Option<Passthrough<ContentBlock>> {
        if self.seen_blocks.contains(&index) {
            return None;
        }
        let block = match delta {
            BlockDelta::TextDelta { .. } => ContentBlock::text(""),
            BlockDelta::ThinkingDelta { .. } => ContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
            _ => return None,
        };
        Some(block.into())
    }
}

fn is_known_event(event_type: &str) -> bool {
    matches!(
        event_type,
        "message_start"
            | "content_block_start"
            | "content_block_delta"
            | "content_block_stop"
            | "message_delta"
            | "message_stop"
            | "ping"
            | "error"
    )
}

pub fn error_event(err: &AppError) -> StreamEvent {
    StreamEvent::Error {
        error: StreamErrorBody {
            kind: err.kind.as_str().to_string(),
            message: err.message.clone(),
        },
    }
}

pub fn to_sse(event: &StreamEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.name()).data(data)
}

async fn send_all(tx: &mpsc::Sender<Event>, events: Vec<StreamEvent>) -> bool {
    for event in events {
        if tx.send(to_sse(&event)).await.is_err() {
            return false;
        }
    }
    true
}

fn record_stream_error(err: &UpstreamError) -> AppError {
    let app_err = classify(err);
    metrics::counter!("proxy_errors_total", "kind" => app_err.kind.as_str()).increment(1);
    tracing::warn!(error = %err, "upstream stream failed");
    app_err
}

/// Spawns the pump task for a Messages stream and returns the SSE body stream.
///
/// The task stops as soon as the client goes away, even while upstream is silent,
/// which drops the upstream body.
pub fn message_events(
    mut upstream: ChunkStream,
    requested_model: String,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let (tx, rx) = mpsc::channel::<Event>(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut mux = Multiplexer::new(requested_model);
        loop {
            let item = tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!("client disconnected, abandoning upstream stream");
                    return;
                }
                item = upstream.next() => item,
            };
            let Some(item) = item else { break };
            let events = match item.and_then(|chunk| mux.push_chunk(&chunk)) {
                Ok(events) => events,
                Err(err) => {
                    let app_err = record_stream_error(&err);
                    send_all(&tx, mux.fail(&app_err)).await;
                    return;
                }
            };
            if !send_all(&tx, events).await {
                tracing::debug!("client disconnected, abandoning upstream stream");
                return;
            }
            if mux.is_finished() {
                return;
            }
        }
        send_all(&tx, mux.finish()).await;
    });
    ReceiverStream::new(rx).map(Ok)
}

/// Builds `completion` events for legacy text-completion streams.
#[derive(Debug)]
pub struct CompletionFramer {
    id: String,
    requested_model: String,
}

impl CompletionFramer {
    pub fn new(requested_model: impl Into<String>) -> Self {
        Self {
            id: completion_id(),
            requested_model: requested_model.into(),
        }
    }

    pub fn push_chunk(&self, chunk: &[u8]) -> Result<CompletionResponse, UpstreamError> {
        let mut event: CompletionResponse = serde_json::from_slice(chunk)
            .map_err(|err| UpstreamError::Decode(format!("invalid completion chunk: {err}")))?;
        event.response_type = "completion".to_string();
        event.id = self.id.clone();
        event.model = self.requested_model.clone();
        Ok(event)
    }
}

fn completion_sse(event: &CompletionResponse) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event("completion").data(data)
}

pub fn completion_events(
    mut upstream: ChunkStream,
    requested_model: String,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let (tx, rx) = mpsc::channel::<Event>(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let framer = CompletionFramer::new(requested_model);
        loop {
            let item = tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!("client disconnected, abandoning upstream stream");
                    return;
                }
                item = upstream.next() => item,
            };
            let Some(item) = item else { break };
            match item.and_then(|chunk| framer.push_chunk(&chunk)) {
                Ok(event) => {
                    if tx.send(completion_sse(&event)).await.is_err() {
                        tracing::debug!("client disconnected, abandoning upstream stream");
                        return;
                    }
                }
                Err(err) => {
                    let app_err = record_stream_error(&err);
                    let _ = tx.send(to_sse(&error_event(&app_err))).await;
                    return;
                }
            }
        }
    });
    ReceiverStream::new(rx).map(Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn chunk(value: Value) -> Vec<u8> {
        value.to_string().into_bytes()
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::name).collect()
    }

    #[test]
    fn passes_through_a_well_formed_stream_and_rewrites_model() {
        let mut mux = Multiplexer::new("claude-3-5-sonnet-20241022");
        let mut all = Vec::new();
        for c in [
            json!({"type": "message_start", "message": {"id": "msg_1", "type": "message", "role": "assistant",
                "model": "anthropic.claude-3-5-sonnet-20241022-v2:0", "content": [], "stop_reason": null,
                "stop_sequence": null, "usage": {"input_tokens": 9, "output_tokens": 1}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {"output_tokens": 2}}),
            json!({"type": "message_stop", "amazon-bedrock-invocationMetrics": {"inputTokenCount": 9}}),
        ] {
            all.extend(mux.push_chunk(&chunk(c)).unwrap());
        }
        assert_eq!(
            names(&all),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        let StreamEvent::MessageStart { message } = &all[0] else {
            panic!("expected message_start");
        };
        assert_eq!(message.model, "claude-3-5-sonnet-20241022");
        assert!(mux.finish().is_empty());
    }

    #[test]
    fn synthesizes_missing_start_and_stops() {
        let mut mux = Multiplexer::new("m");
        let mut all = mux.push(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::TextDelta {
                text: "Hello".to_string(),
            }
            .into(),
        });
        all.extend(mux.finish());
        assert_eq!(
            names(&all),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_stop"
            ]
        );
    }

    #[test]
    fn duplicate_message_start_is_dropped() {
        let mut mux = Multiplexer::new("m");
        let start = StreamEvent::MessageStart {
            message: serde_json::from_value(json!({"id": "msg_1", "content": [], "model": "x"})).unwrap(),
        };
        assert_eq!(mux.push(start.clone()).len(), 1);
        assert!(mux.push(start).is_empty());
    }

    #[test]
    fn message_delta_closes_open_blocks_first() {
        let mut mux = Multiplexer::new("m");
        mux.push(StreamEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::text("").into(),
        });
        let out = mux.push(StreamEvent::MessageDelta {
            delta: Default::default(),
            usage: None,
        });
        assert_eq!(names(&out), vec!["content_block_stop", "message_delta"]);
    }

    #[test]
    fn nothing_follows_message_stop() {
        let mut mux = Multiplexer::new("m");
        mux.push(StreamEvent::MessageStop);
        assert!(mux.push(StreamEvent::Ping).is_empty());
        assert!(mux.fail(&AppError::internal("late")).is_empty());
    }

    #[test]
    fn failure_emits_a_single_error_event() {
        let mut mux = Multiplexer::new("m");
        let out = mux.fail(&AppError::new(ErrorKind::RateLimit, "slow down"));
        assert_eq!(
            serde_json::to_value(&out[0]).unwrap(),
            json!({"type": "error", "error": {"type": "rate_limit_error", "message": "slow down"}})
        );
        assert!(mux.finish().is_empty());
    }

    #[test]
    fn unknown_event_types_are_skipped_but_bad_known_ones_fail() {
        let mut mux = Multiplexer::new("m");
        assert!(mux.push_chunk(br#"{"type":"future_event"}"#).unwrap().is_empty());
        assert!(mux.push_chunk(br#"{"type":"content_block_delta"}"#).is_err());
        assert!(mux.push_chunk(b"not json").is_err());
    }

    #[test]
    fn unknown_delta_types_are_forwarded_verbatim() {
        let mut mux = Multiplexer::new("m");
        mux.push_chunk(&chunk(json!({"type": "content_block_start", "index": 0,
            "content_block": {"type": "text", "text": ""}})))
            .unwrap();
        let out = mux
            .push_chunk(&chunk(json!({"type": "content_block_delta", "index": 0,
                "delta": {"type": "compaction_delta", "content": "x"}})))
            .unwrap();
        assert_eq!(
            serde_json::to_value(&out[0]).unwrap()["delta"],
            json!({"type": "compaction_delta", "content": "x"})
        );
    }

    #[test]
    fn completion_chunks_get_a_stable_id_and_model() {
        let framer = CompletionFramer::new("claude-2.1");
        let a = framer
            .push_chunk(br#"{"completion":"Hel","stop_reason":null,"stop":null}"#)
            .unwrap();
        let b = framer
            .push_chunk(br#"{"completion":"lo","stop_reason":"stop_sequence","stop":"\n\nHuman:","amazon-bedrock-invocationMetrics":{}}"#)
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.model, "claude-2.1");
        assert_eq!(format!("{}{}", a.completion, b.completion), "Hello");
    }

    #[tokio::test]
    async fn pump_ends_with_error_event_on_upstream_failure() {
        let items: Vec<Result<bytes::Bytes, UpstreamError>> = vec![
            Ok(bytes::Bytes::from(chunk(json!({"type": "content_block_delta", "index": 0,
                "delta": {"type": "text_delta", "text": "Hi"}})))),
            Err(UpstreamError::api(
                crate::upstream::Operation::InvokeModelWithResponseStream,
                429,
                "ThrottlingException",
                "Too many requests",
            )),
        ];
        let upstream = futures_util::stream::iter(items).boxed();
        let events: Vec<_> = message_events(upstream, "m".to_string()).collect().await;
        assert_eq!(events.len(), 4);
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    async fn wait_for(flag: &AtomicBool) -> bool {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !flag.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn silent_upstream_is_released_when_client_leaves() {
        let dropped = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(dropped.clone());
        let first: Result<bytes::Bytes, UpstreamError> = Ok(bytes::Bytes::from(chunk(
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi"}}),
        )));
        let upstream = futures_util::stream::iter(vec![first])
            .chain(futures_util::stream::pending())
            .map(move |item| {
                let _held = &guard;
                item
            })
            .boxed();

        let mut events = Box::pin(message_events(upstream, "m".to_string()));
        assert!(events.next().await.is_some());
        drop(events);
        assert!(wait_for(&dropped).await, "upstream stream was not dropped");
    }

    #[tokio::test]
    async fn silent_completion_upstream_is_released_when_client_leaves() {
        let dropped = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(dropped.clone());
        let upstream = futures_util::stream::pending::<Result<bytes::Bytes, UpstreamError>>()
            .map(move |item| {
                let _held = &guard;
                item
            })
            .boxed();

        let events = completion_events(upstream, "claude-2.1".to_string());
        drop(events);
        assert!(wait_for(&dropped).await, "upstream stream was not dropped");
    }
}
