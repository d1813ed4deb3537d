//! Length-prefixed frame codec.
//!
//! The decoder is incremental: bytes are fed in as they arrive from the
//! socket and complete frames are pulled out as they become available. It
//! tolerates arbitrary fragmentation and coalescing — partial headers,
//! partial payloads, several frames in a single read.

use serde_json::Value;
use thiserror::Error;

/// Upper bound on a single frame's payload (16 MiB). A peer announcing a
/// larger frame is treated as a framing error rather than a reason to
/// buffer without limit.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("zero-length frame")]
    Empty,

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),

    #[error("frame payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("batch requests are not supported")]
    Batch,

    #[error("frame payload is not a JSON object")]
    NotAnObject,
}

/// Encode one JSON object as a length-prefixed frame.
pub fn encode_frame(value: &Value) -> Result<Vec<u8>, FrameError> {
    if !value.is_object() {
        return Err(if value.is_array() {
            FrameError::Batch
        } else {
            FrameError::NotAnObject
        });
    }
    let payload = serde_json::to_vec(value)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Incremental decoder over a byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder { buf: Vec::new() }
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete frame, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Any error is terminal
    /// for the stream; the enclosing channel must close.
    pub fn next_frame(&mut self) -> Result<Option<Value>, FrameError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len == 0 {
            return Err(FrameError::Empty);
        }
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let value: Value = serde_json::from_slice(&self.buf[4..4 + len])?;
        self.buf.drain(..4 + len);
        match value {
            Value::Object(_) => Ok(Some(value)),
            Value::Array(_) => Err(FrameError::Batch),
            _ => Err(FrameError::NotAnObject),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(value) = decoder.next_frame().unwrap() {
            out.push(value);
        }
        out
    }

    #[test]
    fn roundtrip() {
        let msg = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        let encoded = encode_frame(&msg).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);
        assert_eq!(decode_all(&mut decoder), vec![msg]);
    }

    #[test]
    fn roundtrip_under_any_partition() {
        let messages = vec![
            json!({"id": 1, "method": "hello", "params": {"protocol": "gaovm.v1.2"}}),
            json!({"id": 1, "result": {"ok": true}}),
            json!({"method": "event", "params": {"type": "driver.exited"}}),
        ];
        let mut stream = Vec::new();
        for msg in &messages {
            stream.extend_from_slice(&encode_frame(msg).unwrap());
        }

        // Byte-at-a-time, a few odd chunk sizes, and the whole stream at once.
        for chunk in [1usize, 3, 7, stream.len()] {
            let mut decoder = FrameDecoder::new();
            let mut decoded = Vec::new();
            for part in stream.chunks(chunk) {
                decoder.push(part);
                decoded.extend(decode_all(&mut decoder));
            }
            assert_eq!(decoded, messages, "chunk size {}", chunk);
        }
    }

    #[test]
    fn zero_length_frame_is_an_error() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&0u32.to_be_bytes());
        assert!(matches!(decoder.next_frame(), Err(FrameError::Empty)));
    }

    #[test]
    fn batch_payload_is_an_error() {
        let payload = b"[{\"id\":1}]";
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(payload);
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame);
        assert!(matches!(decoder.next_frame(), Err(FrameError::Batch)));
    }

    #[test]
    fn non_object_payload_is_an_error() {
        let payload = b"42";
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(payload);
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame);
        assert!(matches!(decoder.next_frame(), Err(FrameError::NotAnObject)));
    }

    #[test]
    fn oversized_header_is_an_error() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
        assert!(matches!(decoder.next_frame(), Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn partial_header_waits_for_more() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0, 0]);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn encode_rejects_batches() {
        assert!(matches!(
            encode_frame(&json!([1, 2])),
            Err(FrameError::Batch)
        ));
        assert!(matches!(
            encode_frame(&json!("hi")),
            Err(FrameError::NotAnObject)
        ));
    }
}
