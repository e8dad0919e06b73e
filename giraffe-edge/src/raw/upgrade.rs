//! WebSocket upgrade forwarding over pooled raw connections.
//!
//! When no raw connection exists for a domain, the edge asks the client to
//! open one (`Control::EstablishRequest`) and parks the upgrade until the
//! pool signals an arrival. At most one parked upgrade resolves per
//! arrival.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use giraffe_wire::{ControlMessage, EstablishProto, Frame, MsgType};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::raw::pool::{RawConn, RawPool, TlsServerStream};
use crate::state::EdgeState;

/// Cap on a forwarded upgrade-response head.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;
/// Deadline for the tunnel side to answer the upgrade request.
const RESPONSE_HEAD_TIMEOUT: Duration = Duration::from_secs(10);

struct Waiter {
    request_id: u64,
    deadline: Instant,
    tx: oneshot::Sender<()>,
}

/// Registry of upgrades waiting for a raw connection to arrive.
#[derive(Default)]
pub struct PendingUpgrades {
    waiters: DashMap<String, Mutex<VecDeque<Waiter>>>,
    next_id: AtomicU64,
}

impl PendingUpgrades {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an upgrade. Returns the establish request id and the wakeup.
    pub fn register(&self, domain: &str, wait: Duration) -> (u64, oneshot::Receiver<()>) {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            request_id,
            deadline: Instant::now() + wait,
            tx,
        };
        self.waiters
            .entry(domain.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()))
            .lock()
            .push_back(waiter);
        (request_id, rx)
    }

    /// Wake exactly one live waiter for this domain, if any.
    pub fn notify(&self, domain: &str) -> bool {
        let Some(queue) = self.waiters.get(domain) else {
            return false;
        };
        let mut queue = queue.lock();
        let now = Instant::now();
        while let Some(waiter) = queue.pop_front() {
            if waiter.deadline < now {
                debug!(domain, request_id = waiter.request_id, "expired upgrade waiter dropped");
                continue;
            }
            if waiter.tx.send(()).is_ok() {
                return true;
            }
        }
        false
    }

    /// Drop a waiter that gave up.
    pub fn forget(&self, domain: &str, request_id: u64) {
        if let Some(queue) = self.waiters.get(domain) {
            queue.lock().retain(|w| w.request_id != request_id);
        }
    }

    pub fn waiting(&self, domain: &str) -> usize {
        self.waiters.get(domain).map(|q| q.lock().len()).unwrap_or(0)
    }
}

/// Forward one sniffed upgrade request over a pooled raw connection.
///
/// `head_bytes` is the exact request head (plus any body bytes already
/// read) to replay onto the tunnel. A broken-pipe class failure on the
/// first write triggers one re-establishment and retry.
pub async fn forward(
    state: &Arc<EdgeState>,
    domain: &str,
    client_sock: &mut TcpStream,
    head_bytes: &[u8],
) -> Result<(), ProxyError> {
    state.metrics.record_upgrade();

    for attempt in 0..2 {
        let (pool, conn) = acquire(state, domain).await?;
        let Some(mut stream) = conn.take_stream() else {
            continue;
        };

        match stream.write_all(head_bytes).await {
            Ok(()) => {}
            Err(e) if attempt == 0 && is_pipe_failure(&e) => {
                warn!(domain, conn_id = conn.id, error = %e, "raw write failed, retrying once");
                pool.remove(&conn);
                continue;
            }
            Err(e) => {
                pool.remove(&conn);
                return Err(e.into());
            }
        }

        let head = match timeout(
            RESPONSE_HEAD_TIMEOUT,
            read_response_head(&mut stream),
        )
        .await
        {
            Ok(Ok(head)) => head,
            Ok(Err(e)) if attempt == 0 && is_pipe_failure(&e) => {
                warn!(domain, conn_id = conn.id, error = %e, "raw read failed, retrying once");
                pool.remove(&conn);
                continue;
            }
            Ok(Err(e)) => {
                pool.remove(&conn);
                return Err(e.into());
            }
            Err(_) => {
                pool.remove(&conn);
                return Err(ProxyError::Timeout);
            }
        };

        client_sock.write_all(&head.raw).await?;

        if head.status == 101 {
            let (from_client, from_tunnel) =
                match tokio::io::copy_bidirectional(client_sock, &mut stream).await {
                    Ok(counts) => counts,
                    Err(e) => {
                        debug!(domain, error = %e, "upgrade stream closed with error");
                        (0, 0)
                    }
                };
            info!(domain, from_client, from_tunnel, "upgrade stream closed");
            state.metrics.record_transfer(from_tunnel, from_client);
            conn.mark_served();
            // the WebSocket session consumed this connection
            pool.remove(&conn);
            return Ok(());
        }

        // Plain response on the raw path: relay the body, then apply the
        // retirement policy.
        let poisoned = matches!(head.status, 502 | 503 | 504) || head.connection_close;
        relay_body(&head, client_sock, &mut stream).await?;
        pool.put_back(&conn, stream, poisoned);
        return Ok(());
    }

    Err(ProxyError::UpgradeTimeout(domain.to_string()))
}

/// Fetch a live connection, establishing one on demand via the RPC session.
async fn acquire(
    state: &Arc<EdgeState>,
    domain: &str,
) -> Result<(Arc<RawPool>, Arc<RawConn<TlsServerStream>>), ProxyError> {
    let pool = state.pools.pool(domain);
    if let Some(conn) = live_conn(&pool).await {
        return Ok((pool, conn));
    }

    let session = state
        .sessions
        .get(domain)
        .ok_or_else(|| ProxyError::NoTunnel(domain.to_string()))?;

    let wait = state.upgrade_wait();
    let (request_id, notified) = state.upgrades.register(domain, wait);
    let establish = ControlMessage::EstablishRequest {
        proto: EstablishProto::Tcp,
        domain: domain.to_string(),
        request_id,
        timeout_ms: wait.as_millis() as u64,
    };
    let frame = Frame::control(MsgType::Control, establish.to_payload()?);
    if session.send(frame).await.is_err() {
        state.upgrades.forget(domain, request_id);
        return Err(ProxyError::TunnelDisconnected);
    }
    debug!(domain, request_id, "establish request sent, waiting for raw connection");

    match timeout(wait, notified).await {
        Ok(Ok(())) => {}
        // timed out, or the waiter was dropped unresolved
        _ => {
            state.upgrades.forget(domain, request_id);
            return Err(ProxyError::UpgradeTimeout(domain.to_string()));
        }
    }

    live_conn(&pool)
        .await
        .map(|conn| (Arc::clone(&pool), conn))
        .ok_or_else(|| ProxyError::UpgradeTimeout(domain.to_string()))
}

async fn live_conn(pool: &Arc<RawPool>) -> Option<Arc<RawConn<TlsServerStream>>> {
    loop {
        let conn = pool.get()?;
        if pool.probe(&conn).await {
            return Some(conn);
        }
        pool.remove(&conn);
    }
}

fn is_pipe_failure(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof
    )
}

struct ResponseHead {
    raw: Vec<u8>,
    status: u16,
    connection_close: bool,
    content_length: Option<u64>,
}

async fn read_response_head<S>(stream: &mut S) -> std::io::Result<ResponseHead>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut raw = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "eof before response head",
            ));
        }
        raw.push(byte[0]);
        if raw.ends_with(b"\r\n\r\n") {
            break;
        }
        if raw.len() > MAX_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                "response head too large",
            ));
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut headers);
    let status = match resp.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => resp.code.unwrap_or(502),
        _ => {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                "malformed response head",
            ))
        }
    };

    let mut connection_close = false;
    let mut content_length = None;
    for h in resp.headers.iter() {
        if h.name.eq_ignore_ascii_case("connection") {
            if let Ok(v) = std::str::from_utf8(h.value) {
                connection_close = v.to_ascii_lowercase().contains("close");
            }
        } else if h.name.eq_ignore_ascii_case("content-length") {
            content_length = std::str::from_utf8(h.value)
                .ok()
                .and_then(|v| v.trim().parse().ok());
        }
    }

    Ok(ResponseHead {
        raw,
        status,
        connection_close,
        content_length,
    })
}

async fn relay_body(
    head: &ResponseHead,
    client_sock: &mut TcpStream,
    stream: &mut TlsServerStream,
) -> std::io::Result<()> {
    match head.content_length {
        Some(0) | None => Ok(()),
        Some(len) => {
            let mut limited = stream.take(len);
            tokio::io::copy(&mut limited, client_sock).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_resolves_exactly_one() {
        let upgrades = PendingUpgrades::new();
        let (_id1, rx1) = upgrades.register("a.example", Duration::from_secs(30));
        let (_id2, rx2) = upgrades.register("a.example", Duration::from_secs(30));
        assert!(upgrades.notify("a.example"));
        assert!(rx1.blocking_recv().is_ok());
        assert_eq!(upgrades.waiting("a.example"), 1);
        drop(rx2);
    }

    #[test]
    fn test_notify_without_waiters() {
        let upgrades = PendingUpgrades::new();
        assert!(!upgrades.notify("a.example"));
    }

    #[test]
    fn test_expired_waiter_skipped() {
        let upgrades = PendingUpgrades::new();
        let (_id1, rx1) = upgrades.register("a.example", Duration::from_millis(0));
        let (_id2, rx2) = upgrades.register("a.example", Duration::from_secs(30));
        std::thread::sleep(Duration::from_millis(5));
        assert!(upgrades.notify("a.example"));
        assert!(rx1.blocking_recv().is_err());
        assert!(rx2.blocking_recv().is_ok());
    }

    #[test]
    fn test_forget_removes_waiter() {
        let upgrades = PendingUpgrades::new();
        let (id, _rx) = upgrades.register("a.example", Duration::from_secs(30));
        upgrades.forget("a.example", id);
        assert_eq!(upgrades.waiting("a.example"), 0);
        assert!(!upgrades.notify("a.example"));
    }

    #[tokio::test]
    async fn test_read_response_head_parses_status() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(
            &mut a,
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        )
        .await
        .unwrap();
        let head = read_response_head(&mut b).await.unwrap();
        assert_eq!(head.status, 101);
        assert!(!head.connection_close);
    }

    #[tokio::test]
    async fn test_read_response_head_connection_close() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(
            &mut a,
            b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\nContent-Length: 3\r\n\r\n",
        )
        .await
        .unwrap();
        let head = read_response_head(&mut b).await.unwrap();
        assert_eq!(head.status, 502);
        assert!(head.connection_close);
        assert_eq!(head.content_length, Some(3));
    }
}
