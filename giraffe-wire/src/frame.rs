//! Binary frame layer for tunnel multiplexing.
//!
//! Frame layout (22-byte header + variable payload):
//! ```text
//! | request_id (8B) | unix_ms (8B) | msg_type (1B) | flags (1B) | payload_len (4B) | payload (NB) |
//! ```
//!
//! HTTP request/response frames embed their head as a length-prefixed JSON
//! block so body bytes stay binary-clean:
//! ```text
//! | head_len (4B) | head JSON | body bytes |
//! ```
//! Continuation chunks of a chunked response carry `head_len = 0`.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;

pub const HEADER_SIZE: usize = 22;

/// Default cap on a whole frame (header + payload): 16 MiB.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Frame flags.
pub mod flags {
    /// Terminal frame of its `request_id`.
    pub const END_STREAM: u8 = 0x01;
    /// Payload is gzip-compressed.
    pub const GZIP: u8 = 0x02;
    /// Frame belongs to a chunked body sequence.
    pub const CHUNKED: u8 = 0x04;
}

/// Message types for the tunnel protocol.
///
/// The tag space is open-ended: decoders reject tags they do not know, but
/// stream dispatchers log and skip them instead of closing the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    HttpRequest = 0x01,
    HttpResponse = 0x02,
    HttpRequestStart = 0x03,
    HttpRequestChunk = 0x04,
    HttpRequestEnd = 0x05,
    Control = 0x10,
    Error = 0x11,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::HttpRequest),
            0x02 => Some(Self::HttpResponse),
            0x03 => Some(Self::HttpRequestStart),
            0x04 => Some(Self::HttpRequestChunk),
            0x05 => Some(Self::HttpRequestEnd),
            0x10 => Some(Self::Control),
            0x11 => Some(Self::Error),
            _ => None,
        }
    }
}

/// A single multiplexed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub request_id: u64,
    pub unix_ms: u64,
    pub msg_type: MsgType,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(request_id: u64, msg_type: MsgType, flags: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            unix_ms: now_unix_ms(),
            msg_type,
            flags,
            payload: payload.into(),
        }
    }

    /// Control frame (request_id = 0).
    pub fn control(msg_type: MsgType, payload: impl Into<Bytes>) -> Self {
        Self::new(0, msg_type, 0, payload)
    }

    /// HTTP frame with a length-prefixed JSON head followed by body bytes.
    pub fn http<H: Serialize>(
        request_id: u64,
        msg_type: MsgType,
        flags: u8,
        head: Option<&H>,
        body: &[u8],
    ) -> Result<Self, ProtocolError> {
        let head_json = match head {
            Some(h) => serde_json::to_vec(h).map_err(ProtocolError::BadHead)?,
            None => Vec::new(),
        };
        let mut payload = BytesMut::with_capacity(4 + head_json.len() + body.len());
        payload.put_u32(head_json.len() as u32);
        payload.put_slice(&head_json);
        payload.put_slice(body);
        Ok(Self::new(request_id, msg_type, flags, payload.freeze()))
    }

    /// Split an HTTP frame payload into (head JSON, body bytes).
    ///
    /// The head is empty for continuation chunks.
    pub fn split_head(&self) -> Result<(Bytes, Bytes), ProtocolError> {
        let mut payload = self.payload.clone();
        if payload.len() < 4 {
            return Err(ProtocolError::TooShort {
                expected: 4,
                actual: payload.len(),
            });
        }
        let head_len = payload.get_u32() as usize;
        if payload.remaining() < head_len {
            return Err(ProtocolError::Incomplete {
                expected: head_len,
                actual: payload.remaining(),
            });
        }
        let head = payload.split_to(head_len);
        Ok((head, payload))
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags & flags::END_STREAM != 0
    }

    pub fn is_chunked(&self) -> bool {
        self.flags & flags::CHUNKED != 0
    }

    pub fn is_gzip(&self) -> bool {
        self.flags & flags::GZIP != 0
    }

    /// Encode into a binary buffer (unchecked; see [`FrameCodec::encode`]).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u64(self.request_id);
        buf.put_u64(self.unix_ms);
        buf.put_u8(self.msg_type as u8);
        buf.put_u8(self.flags);
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode from a binary buffer (unchecked; see [`FrameCodec::decode`]).
    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::TooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        let request_id = data.get_u64();
        let unix_ms = data.get_u64();
        let msg_type_raw = data.get_u8();
        let frame_flags = data.get_u8();
        let payload_len = data.get_u32() as usize;

        if data.remaining() < payload_len {
            return Err(ProtocolError::Incomplete {
                expected: HEADER_SIZE + payload_len,
                actual: HEADER_SIZE + data.remaining(),
            });
        }

        let msg_type =
            MsgType::from_u8(msg_type_raw).ok_or(ProtocolError::UnknownTag(msg_type_raw))?;
        let payload = data.split_to(payload_len);

        Ok(Self {
            request_id,
            unix_ms,
            msg_type,
            flags: frame_flags,
            payload,
        })
    }
}

/// Size-checked codec. Both directions enforce the configured frame cap.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl FrameCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    pub fn encode(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let len = HEADER_SIZE + frame.payload.len();
        if len > self.max_frame {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame,
            });
        }
        Ok(frame.encode())
    }

    pub fn decode(&self, data: Bytes) -> Result<Frame, ProtocolError> {
        if data.len() > self.max_frame {
            return Err(ProtocolError::FrameTooLarge {
                len: data.len(),
                max: self.max_frame,
            });
        }
        Frame::decode(data)
    }
}

/// Protocol errors.
///
/// `UnknownTag` is the only recoverable variant: dispatchers drop the frame
/// and keep reading. Everything else closes the stream.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("frame incomplete: expected {expected} bytes, got {actual}")]
    Incomplete { expected: usize, actual: usize },
    #[error("unknown message tag: 0x{0:02x}")]
    UnknownTag(u8),
    #[error("frame too large: {len} bytes exceeds cap of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("invalid head JSON: {0}")]
    BadHead(#[source] serde_json::Error),
    #[error("gzip: {0}")]
    Gzip(#[source] std::io::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the stream can survive this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::UnknownTag(_))
    }
}

/// Gzip-compress a payload, returning it with the GZIP flag to set.
pub fn compress(payload: &[u8]) -> Result<Bytes, ProtocolError> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).map_err(ProtocolError::Gzip)?;
    Ok(Bytes::from(encoder.finish().map_err(ProtocolError::Gzip)?))
}

/// Return the frame payload, decompressing when the GZIP flag is set.
pub fn decompress_if_gzip(frame: &Frame) -> Result<Bytes, ProtocolError> {
    if !frame.is_gzip() {
        return Ok(frame.payload.clone());
    }
    use flate2::read::GzDecoder;
    use std::io::Read;
    let mut decoder = GzDecoder::new(frame.payload.as_ref());
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf).map_err(ProtocolError::Gzip)?;
    Ok(Bytes::from(buf))
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ResponseHead;

    #[test]
    fn test_roundtrip() {
        let frame = Frame::new(42, MsgType::HttpResponse, flags::END_STREAM, "hello");
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        let frame = Frame::new(7, MsgType::HttpRequestEnd, 0, Bytes::new());
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_unknown_tag_is_recoverable() {
        let mut raw = BytesMut::from(&Frame::new(1, MsgType::Control, 0, "x").encode()[..]);
        raw[16] = 0x7f; // msg_type byte
        let err = Frame::decode(raw.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag(0x7f)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_truncated_header() {
        let err = Frame::decode(Bytes::from_static(&[0u8; 10])).unwrap_err();
        assert!(matches!(err, ProtocolError::TooShort { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_codec_at_cap_succeeds() {
        let codec = FrameCodec::new(HEADER_SIZE + 64);
        let frame = Frame::new(1, MsgType::HttpRequestChunk, 0, vec![0u8; 64]);
        let encoded = codec.encode(&frame).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE + 64);
        codec.decode(encoded).unwrap();
    }

    #[test]
    fn test_codec_over_cap_fails() {
        let codec = FrameCodec::new(HEADER_SIZE + 64);
        let frame = Frame::new(1, MsgType::HttpRequestChunk, 0, vec![0u8; 65]);
        let err = codec.encode(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));

        let oversize = Frame::new(1, MsgType::HttpRequestChunk, 0, vec![0u8; 65]).encode();
        let err = codec.decode(oversize).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_http_head_split() {
        let head = ResponseHead {
            status: 200,
            headers: vec![("content-type".into(), "text/plain".into())],
        };
        let frame = Frame::http(3, MsgType::HttpResponse, flags::END_STREAM, Some(&head), b"hi")
            .unwrap();
        let (head_json, body) = frame.split_head().unwrap();
        let parsed: ResponseHead = serde_json::from_slice(&head_json).unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(&body[..], b"hi");
    }

    #[test]
    fn test_http_continuation_chunk_has_empty_head() {
        let frame =
            Frame::http::<ResponseHead>(3, MsgType::HttpResponse, flags::CHUNKED, None, b"abc")
                .unwrap();
        let (head_json, body) = frame.split_head().unwrap();
        assert!(head_json.is_empty());
        assert_eq!(&body[..], b"abc");
    }

    #[test]
    fn test_gzip_roundtrip() {
        let data = vec![7u8; 4096];
        let compressed = compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        let frame = Frame::new(9, MsgType::HttpRequestChunk, flags::GZIP, compressed);
        assert_eq!(decompress_if_gzip(&frame).unwrap(), Bytes::from(data));
    }

    #[test]
    fn test_plain_payload_passthrough() {
        let frame = Frame::new(9, MsgType::HttpRequestChunk, 0, "plain");
        assert_eq!(&decompress_if_gzip(&frame).unwrap()[..], b"plain");
    }
}
