//! Frame encoder for the mock Bedrock runtime.

#![allow(dead_code)]

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{BufMut, Bytes, BytesMut};
use flate2::Crc;

fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

/// Encodes one event-stream message with string-valued headers.
pub fn encode_message(headers: &[(&str, &str)], payload: &[u8]) -> Bytes {
    let mut header_buf = BytesMut::new();
    for (name, value) in headers {
        header_buf.put_u8(name.len() as u8);
        header_buf.put_slice(name.as_bytes());
        header_buf.put_u8(7);
        header_buf.put_u16(value.len() as u16);
        header_buf.put_slice(value.as_bytes());
    }
    let total_len = 12 + header_buf.len() + payload.len() + 4;

    let mut out = BytesMut::with_capacity(total_len);
    out.put_u32(total_len as u32);
    out.put_u32(header_buf.len() as u32);
    let prelude_crc = crc32(&out[..8]);
    out.put_u32(prelude_crc);
    out.put_slice(&header_buf);
    out.put_slice(payload);
    let message_crc = crc32(&out);
    out.put_u32(message_crc);
    out.freeze()
}

/// A `chunk` frame wrapping one model event.
pub fn encode_chunk(json: &[u8]) -> Bytes {
    let payload = serde_json::json!({ "bytes": BASE64.encode(json) }).to_string();
    encode_message(
        &[
            (":event-type", "chunk"),
            (":content-type", "application/json"),
            (":message-type", "event"),
        ],
        payload.as_bytes(),
    )
}

/// A mid-stream exception frame.
pub fn encode_exception(exception_type: &str, message: &str) -> Bytes {
    let payload = serde_json::json!({ "message": message }).to_string();
    encode_message(
        &[
            (":exception-type", exception_type),
            (":content-type", "application/json"),
            (":message-type", "exception"),
        ],
        payload.as_bytes(),
    )
}
