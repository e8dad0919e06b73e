//! Ingress accept loop: sniff, classify, dispatch, answer.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use giraffe_wire::RequestHead;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::raw::upgrade;
use crate::router::sniff::{self, SniffedRequest};
use crate::router::{classify, Transport};
use crate::rpc::proxy::{self, BodySource};
use crate::state::EdgeState;

pub async fn run(
    state: Arc<EdgeState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.ingress_port));
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "ingress listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to accept ingress connection");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    handle_conn(state, stream, peer_addr).await;
                });
            }
            _ = shutdown.changed() => {
                info!("ingress shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_conn(state: Arc<EdgeState>, mut stream: TcpStream, peer_addr: SocketAddr) {
    let _ = stream.set_nodelay(true);

    let buf = state.buffers.get();
    let (buf, sniffed) = sniff::sniff(&mut stream, buf).await;
    state.buffers.put(buf);

    let req = match sniffed {
        Ok(req) => req,
        Err(sniff::SniffError::Closed) => return,
        Err(e) => {
            debug!(peer = %peer_addr, error = %e, "unparseable request head");
            let _ = write_plain_response(&mut stream, 400, "malformed request").await;
            return;
        }
    };

    let Some(domain) = req.domain() else {
        let _ = write_plain_response(&mut stream, 400, "missing Host header").await;
        return;
    };

    let transport = classify(&req);
    debug!(
        peer = %peer_addr,
        domain = %domain,
        method = %req.method,
        path = %req.path,
        transport = ?transport,
        "ingress request"
    );

    let result = match transport {
        Transport::Raw => {
            upgrade::forward(&state, &domain, &mut stream, &req.replay_bytes()).await
        }
        Transport::Rpc | Transport::RpcChunked => {
            serve_rpc(&state, &domain, req, &mut stream, peer_addr).await
        }
    };

    if let Err(e) = result {
        warn!(peer = %peer_addr, domain = %domain, error = %e, "request failed");
        let _ = write_error_response(&mut stream, &domain, &e).await;
    }
}

async fn serve_rpc(
    state: &Arc<EdgeState>,
    domain: &str,
    req: SniffedRequest,
    stream: &mut TcpStream,
    peer_addr: SocketAddr,
) -> Result<(), ProxyError> {
    let session = state
        .sessions
        .get(domain)
        .ok_or_else(|| ProxyError::NoTunnel(domain.to_string()))?;

    // handshakes never hit this gate; only proxied requests do
    if !state.rate.allow(domain) {
        state.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
        return Err(ProxyError::RateLimited(domain.to_string()));
    }

    let quota = state.quota.check(session.user_id).await;
    if quota.block {
        state.metrics.quota_blocked.fetch_add(1, Ordering::Relaxed);
        return Err(ProxyError::QuotaBlocked {
            used: quota.used_bytes,
            limit: quota.limit_bytes,
        });
    }

    let mut head = RequestHead {
        method: req.method.clone(),
        path: req.path.clone(),
        headers: req.headers.clone(),
        content_length: req.content_length(),
        client_ip: Some(peer_addr.ip().to_string()),
    };
    if quota.warn {
        head.headers.push(("X-Quota-Warn".into(), "true".into()));
    }

    state.metrics.record_request();

    let content_length = req.content_length().unwrap_or(0);
    let leftover = req.leftover.clone();
    let (rd, wr) = stream.split();
    let mut out = CountingWriter::new(wr);

    let result = if content_length > state.config.chunk_threshold() {
        let mut reader = std::io::Cursor::new(leftover).chain(rd);
        proxy::exchange(
            state,
            &session,
            head,
            BodySource::Streaming {
                reader: &mut reader,
                remaining: content_length,
            },
            &mut out,
        )
        .await
    } else {
        let body = read_full_body(leftover, rd, content_length).await?;
        proxy::exchange(
            state,
            &session,
            head,
            BodySource::Full::<tokio::io::ReadHalf<TcpStream>>(body),
            &mut out,
        )
        .await
    };

    match result {
        Ok(stats) => {
            state
                .usage
                .record(
                    session.tunnel_id,
                    session.user_id,
                    stats.bytes_in,
                    stats.bytes_out,
                )
                .await;
            state.metrics.record_transfer(stats.bytes_in, stats.bytes_out);
            Ok(())
        }
        Err(e) if out.written == 0 => Err(e),
        Err(e) => {
            // response already under way; the close delimits the stream
            debug!(domain, error = %e, "request failed mid-response");
            Ok(())
        }
    }
}

async fn read_full_body<R>(
    leftover: Bytes,
    mut rd: R,
    content_length: u64,
) -> Result<Bytes, ProxyError>
where
    R: AsyncRead + Unpin,
{
    if content_length == 0 {
        return Ok(Bytes::new());
    }
    let mut body = Vec::with_capacity(content_length as usize);
    body.extend_from_slice(&leftover);
    while (body.len() as u64) < content_length {
        let mut chunk = vec![0u8; 64 * 1024];
        let n = rd.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length as usize);
    Ok(Bytes::from(body))
}

async fn write_error_response(
    stream: &mut TcpStream,
    domain: &str,
    err: &ProxyError,
) -> std::io::Result<()> {
    match err {
        ProxyError::NoTunnel(_) => {
            let body = tunnel_not_connected_page(domain);
            write_response(stream, 503, "text/html; charset=utf-8", body.as_bytes()).await
        }
        ProxyError::QuotaBlocked { used, limit } => {
            let body = format!("Quota exceeded: {} of {} bytes used", used, limit);
            write_plain_response(stream, 402, &body).await
        }
        other => write_plain_response(stream, other.status(), &other.to_string()).await,
    }
}

async fn write_plain_response(
    stream: &mut TcpStream,
    status: u16,
    body: &str,
) -> std::io::Result<()> {
    write_response(stream, status, "text/plain; charset=utf-8", body.as_bytes()).await
}

async fn write_response<W>(
    stream: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        proxy::reason_phrase(status),
        content_type,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

/// The distinctive page served when a domain has no live tunnel.
fn tunnel_not_connected_page(domain: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Tunnel Not Connected</title></head>\n<body>\n\
         <h1>Tunnel Not Connected</h1>\n\
         <p>The tunnel for <strong>{domain}</strong> is not currently connected.</p>\n\
         <p>Start the GiraffeCloud agent on the machine serving this domain, then retry in a few seconds.</p>\n\
         </body>\n</html>\n"
    )
}

/// Write half that remembers whether anything was sent, so error pages are
/// only written onto pristine connections.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_full_body_combines_leftover() {
        let (mut a, b) = tokio::io::duplex(1024);
        a.write_all(b"world").await.unwrap();
        drop(a);
        let body = read_full_body(Bytes::from_static(b"hello "), b, 11).await.unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_read_full_body_zero_length() {
        let (a, b) = tokio::io::duplex(16);
        drop(a);
        let body = read_full_body(Bytes::new(), b, 0).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_write_response_shape() {
        let mut out = Vec::new();
        write_response(&mut out, 429, "text/plain; charset=utf-8", b"slow down")
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 429 Too Many Requests\r\n"));
        assert!(text.contains("Content-Length: 9\r\n"));
        assert!(text.ends_with("slow down"));
    }

    #[test]
    fn test_not_connected_page_mentions_domain() {
        let page = tunnel_not_connected_page("a.example");
        assert!(page.contains("a.example"));
        assert!(page.contains("retry"));
    }

    #[tokio::test]
    async fn test_counting_writer_counts() {
        let mut out = CountingWriter::new(Vec::new());
        out.write_all(b"abc").await.unwrap();
        assert_eq!(out.written, 3);
    }
}
