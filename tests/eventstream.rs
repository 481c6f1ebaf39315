mod common;

use aws_event_stream_parser::EventStreamCodec;
use bedrock_claude_proxy::eventstream::{UpstreamEvent, decode_chunks};
use bedrock_claude_proxy::upstream::UpstreamError;
use bytes::{Bytes, BytesMut};
use common::{encode_chunk, encode_exception, encode_message};
use futures_util::stream::{self, StreamExt};
use tokio_util::codec::Decoder;

async fn decode_all(parts: Vec<Bytes>) -> Vec<Result<Bytes, UpstreamError>> {
    let source = stream::iter(parts.into_iter().map(Ok::<_, UpstreamError>));
    decode_chunks(source).collect().await
}

#[tokio::test]
async fn frame_split_across_reads_is_reassembled() {
    let frame = encode_chunk(br#"{"type":"ping"}"#);
    let items = decode_all(vec![frame.slice(..5), frame.slice(5..20), frame.slice(20..)]).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(br#"{"type":"ping"}"#));
}

#[tokio::test]
async fn two_frames_in_one_read() {
    let mut data = BytesMut::new();
    data.extend_from_slice(&encode_chunk(b"{}"));
    data.extend_from_slice(&encode_chunk(b"[]"));
    let items = decode_all(vec![data.freeze()]).await;
    let chunks: Vec<_> = items.into_iter().map(Result::unwrap).collect();
    assert_eq!(chunks, vec![Bytes::from_static(b"{}"), Bytes::from_static(b"[]")]);
}

#[tokio::test]
async fn corrupted_payload_is_a_decode_error() {
    let mut frame = encode_chunk(b"{}").to_vec();
    let idx = frame.len() - 6;
    frame[idx] ^= 0xff;
    let items = decode_all(vec![Bytes::from(frame)]).await;
    assert!(matches!(items.as_slice(), [Err(UpstreamError::Decode(_))]));
}

#[tokio::test]
async fn exception_frame_stops_the_stream() {
    let mut body = BytesMut::new();
    body.extend_from_slice(&encode_chunk(br#"{"a":1}"#));
    body.extend_from_slice(&encode_exception("modelStreamErrorException", "boom"));
    body.extend_from_slice(&encode_chunk(br#"{"a":2}"#));
    let items = decode_all(vec![body.freeze()]).await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(br#"{"a":1}"#));
    let err = items[1].as_ref().unwrap_err();
    assert_eq!(err.code(), Some("ModelStreamErrorException"));
    assert!(err.to_string().contains("boom"));
}

#[tokio::test]
async fn throttling_exception_keeps_its_status() {
    let items = decode_all(vec![encode_exception("throttlingException", "Too many requests")]).await;
    match items.as_slice() {
        [Err(UpstreamError::Api { status, code, message, .. })] => {
            assert_eq!(*status, 429);
            assert_eq!(code, "ThrottlingException");
            assert_eq!(message, "Too many requests");
        }
        other => panic!("unexpected items: {other:?}"),
    }
}

#[tokio::test]
async fn truncated_body_is_an_error() {
    let frame = encode_chunk(b"{}");
    let items = decode_all(vec![frame.slice(..frame.len() - 3)]).await;
    assert!(matches!(items.as_slice(), [Err(UpstreamError::Decode(_))]));
}

#[tokio::test]
async fn bad_base64_is_an_error() {
    let frame = encode_message(
        &[(":event-type", "chunk"), (":message-type", "event")],
        br#"{"bytes":"***"}"#,
    );
    let items = decode_all(vec![frame]).await;
    assert!(matches!(items.as_slice(), [Err(UpstreamError::Decode(_))]));
}

#[tokio::test]
async fn unconsumed_event_types_are_skipped() {
    let mut body = BytesMut::new();
    body.extend_from_slice(&encode_message(
        &[(":event-type", "initial-response"), (":message-type", "event")],
        b"{}",
    ));
    body.extend_from_slice(&encode_chunk(br#"{"type":"message_stop"}"#));
    let items = decode_all(vec![body.freeze()]).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(br#"{"type":"message_stop"}"#));
}

#[test]
fn error_frame_is_typed_as_exception() {
    let frame = encode_message(
        &[
            (":message-type", "error"),
            (":error-code", "internalFailure"),
            (":error-message", "oops"),
        ],
        b"",
    );
    let mut buf = BytesMut::from(&frame[..]);
    let msg = EventStreamCodec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(
        UpstreamEvent::from_message(&msg).unwrap(),
        UpstreamEvent::Exception {
            code: "InternalFailure".to_string(),
            message: "oops".to_string(),
        }
    );
}
