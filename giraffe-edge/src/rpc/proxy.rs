//! Request multiplexing over an RPC session.
//!
//! Each proxied request gets a fresh `request_id` and a bounded response
//! sink. Small bodies travel as one `HttpRequest` frame; large uploads are
//! streamed as `HttpRequestStart + HttpRequestChunk* + HttpRequestEnd`.
//! Responses arrive either as a single terminal `HttpResponse` or as an
//! ordered chunk sequence whose last frame carries the end-stream flag.

use std::sync::Arc;

use bytes::Bytes;
use giraffe_wire::{flags, ErrorPayload, Frame, MsgType, RequestHead, ResponseHead};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use crate::error::ProxyError;
use crate::session::TunnelSession;
use crate::state::EdgeState;

/// Upload/download chunk size on the wire.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// How the request body reaches the tunnel.
pub enum BodySource<'a, R> {
    /// Entire body already in memory (at most the frame cap).
    Full(Bytes),
    /// Body streamed off the ingress socket in chunks.
    Streaming { reader: &'a mut R, remaining: u64 },
}

/// Byte counts for usage attribution, captured at dispatch time.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExchangeStats {
    pub status: u16,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Removes the pending sink when the exchange ends, however it ends.
struct PendingGuard<'a> {
    session: &'a Arc<TunnelSession>,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session.complete_request(self.request_id);
    }
}

/// Run one proxied request over the session, writing the HTTP response to
/// `out` as frames arrive.
pub async fn exchange<R, W>(
    state: &Arc<EdgeState>,
    session: &Arc<TunnelSession>,
    head: RequestHead,
    body: BodySource<'_, R>,
    out: &mut W,
) -> Result<ExchangeStats, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (request_id, mut sink) = session.register_request();
    let _guard = PendingGuard {
        session,
        request_id,
    };
    let mut stats = ExchangeStats::default();

    send_request(state, session, request_id, &head, body, &mut stats).await?;

    let deadline = state.request_timeout();
    let mut response_started = false;
    loop {
        let frame = match timeout(deadline, sink.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(ProxyError::TunnelDisconnected),
            Err(_) => {
                debug!(request_id, domain = %session.domain, "request deadline exceeded");
                return Err(ProxyError::Timeout);
            }
        };

        match frame.msg_type {
            MsgType::Error => {
                let payload = ErrorPayload::from_payload(&frame.payload)?;
                return Err(ProxyError::Remote(payload));
            }
            MsgType::HttpResponse => {
                let end = frame.is_end_stream();
                let chunked = frame.is_chunked();
                let (head_json, body_bytes) = frame.split_head()?;

                if !response_started {
                    if head_json.is_empty() {
                        return Err(ProxyError::TunnelDisconnected);
                    }
                    let resp_head: ResponseHead = serde_json::from_slice(&head_json)
                        .map_err(giraffe_wire::ProtocolError::BadHead)?;
                    stats.status = resp_head.status;
                    let full_length = if chunked { None } else { Some(body_bytes.len() as u64) };
                    write_response_head(out, &resp_head, full_length).await?;
                    response_started = true;
                }

                if !body_bytes.is_empty() {
                    out.write_all(&body_bytes).await?;
                    stats.bytes_out += body_bytes.len() as u64;
                }
                if end {
                    out.flush().await?;
                    return Ok(stats);
                }
            }
            other => {
                debug!(request_id, msg_type = ?other, "unexpected frame on response sink");
            }
        }
    }
}

async fn send_request<R>(
    state: &Arc<EdgeState>,
    session: &Arc<TunnelSession>,
    request_id: u64,
    head: &RequestHead,
    body: BodySource<'_, R>,
    stats: &mut ExchangeStats,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
{
    match body {
        BodySource::Full(bytes) => {
            stats.bytes_in += bytes.len() as u64;
            let frame = Frame::http(
                request_id,
                MsgType::HttpRequest,
                flags::END_STREAM,
                Some(head),
                &bytes,
            )?;
            session
                .send(frame)
                .await
                .map_err(|_| ProxyError::TunnelDisconnected)?;
        }
        BodySource::Streaming {
            reader,
            mut remaining,
        } => {
            let start = Frame::http(
                request_id,
                MsgType::HttpRequestStart,
                flags::CHUNKED,
                Some(head),
                &[],
            )?;
            session
                .send(start)
                .await
                .map_err(|_| ProxyError::TunnelDisconnected)?;

            let mut buf = vec![0u8; CHUNK_SIZE.min(state.config.max_frame_bytes() / 2)];
            while remaining > 0 {
                let want = buf.len().min(remaining as usize);
                let n = reader.read(&mut buf[..want]).await?;
                if n == 0 {
                    break;
                }
                remaining -= n as u64;
                stats.bytes_in += n as u64;
                let chunk = Frame::new(
                    request_id,
                    MsgType::HttpRequestChunk,
                    flags::CHUNKED,
                    Bytes::copy_from_slice(&buf[..n]),
                );
                session
                    .send(chunk)
                    .await
                    .map_err(|_| ProxyError::TunnelDisconnected)?;
            }

            let end = Frame::new(
                request_id,
                MsgType::HttpRequestEnd,
                flags::CHUNKED | flags::END_STREAM,
                Bytes::new(),
            );
            session
                .send(end)
                .await
                .map_err(|_| ProxyError::TunnelDisconnected)?;
        }
    }
    Ok(())
}

/// Headers the edge manages itself on the hop to the public caller.
fn is_hop_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("content-length")
}

async fn write_response_head<W>(
    out: &mut W,
    head: &ResponseHead,
    full_length: Option<u64>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(
        format!("HTTP/1.1 {} {}\r\n", head.status, reason_phrase(head.status)).as_bytes(),
    );
    for (name, value) in &head.headers {
        if is_hop_header(name) {
            continue;
        }
        buf.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    match full_length {
        Some(len) => {
            buf.extend_from_slice(format!("Content-Length: {}\r\n", len).as_bytes());
        }
        None => {
            // chunk stream of unknown length: delimit by closing
            if let Some(len) = head.header("content-length") {
                buf.extend_from_slice(format!("Content-Length: {}\r\n", len).as_bytes());
            }
        }
    }
    buf.extend_from_slice(b"Connection: close\r\n\r\n");
    out.write_all(&buf).await
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::WRITER_CAPACITY;
    use giraffe_wire::ErrorCode;
    use std::time::Duration;

    fn test_state() -> Arc<EdgeState> {
        crate::app::build_test_state()
    }

    fn test_session() -> (Arc<TunnelSession>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(WRITER_CAPACITY);
        (
            Arc::new(TunnelSession::new(
                "a.example".into(),
                1,
                1,
                8080,
                "203.0.113.9".into(),
                tx,
            )),
            rx,
        )
    }

    fn get_head() -> RequestHead {
        RequestHead {
            method: "GET".into(),
            path: "/hello".into(),
            headers: vec![("Host".into(), "a.example".into())],
            content_length: None,
            client_ip: None,
        }
    }

    #[tokio::test]
    async fn test_small_request_single_frame_response() {
        let state = test_state();
        let (session, mut wire_rx) = test_session();
        let mut out = Vec::new();

        let exchange_fut = exchange(
            &state,
            &session,
            get_head(),
            BodySource::Full::<tokio::io::DuplexStream>(Bytes::new()),
            &mut out,
        );

        let respond = async {
            let sent = wire_rx.recv().await.unwrap();
            assert_eq!(sent.msg_type, MsgType::HttpRequest);
            assert!(sent.is_end_stream());
            let head = ResponseHead {
                status: 200,
                headers: vec![("content-type".into(), "text/plain".into())],
            };
            session.deliver(
                Frame::http(sent.request_id, MsgType::HttpResponse, flags::END_STREAM, Some(&head), b"hi")
                    .unwrap(),
            );
        };

        let (result, ()) = tokio::join!(exchange_fut, respond);
        let stats = result.unwrap();
        assert_eq!(stats.status, 200);
        assert_eq!(stats.bytes_out, 2);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("hi"));
        // terminal frame seen, so the sink is gone
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_chunked_response_preserves_order() {
        let state = test_state();
        let (session, mut wire_rx) = test_session();
        let mut out = Vec::new();

        let exchange_fut = exchange(
            &state,
            &session,
            get_head(),
            BodySource::Full::<tokio::io::DuplexStream>(Bytes::new()),
            &mut out,
        );

        let respond = async {
            let sent = wire_rx.recv().await.unwrap();
            let id = sent.request_id;
            let head = ResponseHead {
                status: 200,
                headers: vec![],
            };
            session.deliver(
                Frame::http(id, MsgType::HttpResponse, flags::CHUNKED, Some(&head), b"part1-")
                    .unwrap(),
            );
            session.deliver(
                Frame::http::<ResponseHead>(id, MsgType::HttpResponse, flags::CHUNKED, None, b"part2-")
                    .unwrap(),
            );
            session.deliver(
                Frame::http::<ResponseHead>(
                    id,
                    MsgType::HttpResponse,
                    flags::CHUNKED | flags::END_STREAM,
                    None,
                    b"part3",
                )
                .unwrap(),
            );
        };

        let (result, ()) = tokio::join!(exchange_fut, respond);
        result.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("part1-part2-part3"));
    }

    #[tokio::test]
    async fn test_error_frame_aborts_exchange() {
        let state = test_state();
        let (session, mut wire_rx) = test_session();
        let mut out = Vec::new();

        let exchange_fut = exchange(
            &state,
            &session,
            get_head(),
            BodySource::Full::<tokio::io::DuplexStream>(Bytes::new()),
            &mut out,
        );

        let respond = async {
            let sent = wire_rx.recv().await.unwrap();
            let payload = ErrorPayload::new(ErrorCode::Upstream, "local service down", true)
                .to_payload()
                .unwrap();
            session.deliver(Frame::new(sent.request_id, MsgType::Error, 0, payload));
        };

        let (result, ()) = tokio::join!(exchange_fut, respond);
        match result {
            Err(ProxyError::Remote(err)) => assert_eq!(err.code, ErrorCode::Upstream),
            other => panic!("expected remote error, got {:?}", other.map(|s| s.status)),
        }
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_streaming_upload_frame_sequence() {
        let state = test_state();
        let (session, mut wire_rx) = test_session();
        let mut out = Vec::new();

        let body = vec![7u8; 10_000];
        let (mut writer, mut reader) = tokio::io::duplex(64 * 1024);
        tokio::io::AsyncWriteExt::write_all(&mut writer, &body).await.unwrap();
        drop(writer);

        let mut head = get_head();
        head.method = "PUT".into();
        head.content_length = Some(body.len() as u64);

        let exchange_fut = exchange(
            &state,
            &session,
            head,
            BodySource::Streaming {
                reader: &mut reader,
                remaining: body.len() as u64,
            },
            &mut out,
        );

        let respond = async {
            let start = wire_rx.recv().await.unwrap();
            assert_eq!(start.msg_type, MsgType::HttpRequestStart);
            let mut got = Vec::new();
            let id = start.request_id;
            loop {
                let frame = wire_rx.recv().await.unwrap();
                match frame.msg_type {
                    MsgType::HttpRequestChunk => got.extend_from_slice(&frame.payload),
                    MsgType::HttpRequestEnd => {
                        assert!(frame.is_end_stream());
                        break;
                    }
                    other => panic!("unexpected frame {:?}", other),
                }
            }
            assert_eq!(got.len(), 10_000);
            let head = ResponseHead {
                status: 201,
                headers: vec![],
            };
            session.deliver(
                Frame::http(id, MsgType::HttpResponse, flags::END_STREAM, Some(&head), b"")
                    .unwrap(),
            );
        };

        let (result, ()) = tokio::join!(exchange_fut, respond);
        assert_eq!(result.unwrap().status, 201);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_sink() {
        let state = test_state();
        let (session, mut wire_rx) = test_session();
        let mut out = Vec::new();

        let exchange_fut = exchange(
            &state,
            &session,
            get_head(),
            BodySource::Full::<tokio::io::DuplexStream>(Bytes::new()),
            &mut out,
        );

        let respond = async {
            let _sent = wire_rx.recv().await.unwrap();
            tokio::time::advance(Duration::from_secs(31)).await;
        };

        let (result, ()) = tokio::join!(exchange_fut, respond);
        assert!(matches!(result, Err(ProxyError::Timeout)));
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn test_hop_headers_filtered() {
        assert!(is_hop_header("Connection"));
        assert!(is_hop_header("transfer-encoding"));
        assert!(is_hop_header("Content-Length"));
        assert!(!is_hop_header("content-type"));
    }
}
