//! Frame I/O over byte streams.
//!
//! The RPC transport carries frames inside WebSocket messages; the raw
//! transport reads its single handshake frame straight off the TLS stream
//! with these helpers.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frame::{Frame, FrameCodec, MsgType, ProtocolError, HEADER_SIZE};

/// Read one frame from a byte stream, enforcing the codec's size cap
/// before the payload is buffered.
pub async fn read_frame<R>(reader: &mut R, codec: &FrameCodec) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let mut cursor = &header[..];
    let request_id = cursor.get_u64();
    let unix_ms = cursor.get_u64();
    let msg_type_raw = cursor.get_u8();
    let flags = cursor.get_u8();
    let payload_len = cursor.get_u32() as usize;

    if HEADER_SIZE + payload_len > codec.max_frame() {
        return Err(ProtocolError::FrameTooLarge {
            len: HEADER_SIZE + payload_len,
            max: codec.max_frame(),
        });
    }

    // consume the payload before rejecting the tag, so a tolerant caller
    // is still frame-aligned after an UnknownTag
    let mut payload = BytesMut::zeroed(payload_len);
    reader.read_exact(&mut payload).await?;

    let msg_type =
        MsgType::from_u8(msg_type_raw).ok_or(ProtocolError::UnknownTag(msg_type_raw))?;

    Ok(Frame {
        request_id,
        unix_ms,
        msg_type,
        flags,
        payload: payload.freeze(),
    })
}

/// Write one frame to a byte stream.
pub async fn write_frame<W>(
    writer: &mut W,
    codec: &FrameCodec,
    frame: &Frame,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = codec.encode(frame)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::flags;

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let codec = FrameCodec::default();
        let frame = Frame::new(5, MsgType::HttpResponse, flags::END_STREAM, "pong");
        write_frame(&mut a, &codec, &frame).await.unwrap();
        let read = read_frame(&mut b, &codec).await.unwrap();
        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn test_oversize_rejected_before_buffering() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let codec = FrameCodec::new(HEADER_SIZE + 8);
        let frame = Frame::new(5, MsgType::HttpRequestChunk, 0, vec![0u8; 32]);
        // write with an unchecked encode to simulate a misbehaving peer
        a.write_all(&frame.encode()).await.unwrap();
        let err = read_frame(&mut b, &codec).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_eof_mid_header() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[1u8; 4]).await.unwrap();
        drop(a);
        let err = read_frame(&mut b, &FrameCodec::default()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }
}
