//! Per-domain pool of authenticated raw-byte connections.
//!
//! Connections are selected round-robin, probed for liveness before use,
//! and retired after bounded reuse. A connection removed from the pool is
//! never re-inserted.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Deadline for the single-byte liveness probe.
const PROBE_DEADLINE: Duration = Duration::from_millis(1);

/// Streams the pool can hold: anything that exposes its TCP socket for
/// probing.
pub trait RawTransport: Send + Sync + Unpin + 'static {
    fn tcp(&self) -> &TcpStream;
}

impl RawTransport for TcpStream {
    fn tcp(&self) -> &TcpStream {
        self
    }
}

impl RawTransport for tokio_rustls::server::TlsStream<TcpStream> {
    fn tcp(&self) -> &TcpStream {
        self.get_ref().0
    }
}

/// The concrete stream type on the raw port.
pub type TlsServerStream = tokio_rustls::server::TlsStream<TcpStream>;

/// One pooled connection. The stream slot is empty while a proxied
/// WebSocket borrows it.
pub struct RawConn<S> {
    pub id: u64,
    stream: Mutex<Option<S>>,
    created_at: Instant,
    request_count: AtomicU32,
    last_used: Mutex<Instant>,
    closed: AtomicBool,
}

impl<S: RawTransport> RawConn<S> {
    fn new(id: u64, stream: S) -> Self {
        Self {
            id,
            stream: Mutex::new(Some(stream)),
            created_at: Instant::now(),
            request_count: AtomicU32::new(0),
            last_used: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        }
    }

    /// Borrow the stream exclusively. `None` while another task holds it.
    pub fn take_stream(&self) -> Option<S> {
        self.stream.lock().take()
    }

    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn mark_served(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        *self.last_used.lock() = Instant::now();
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Idempotent close: the stream is dropped at most once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(self.stream.lock().take());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Per-domain connection pool with a monotonic round-robin cursor.
pub struct RawPool<S: RawTransport = TlsServerStream> {
    domain: String,
    conns: Mutex<Vec<Arc<RawConn<S>>>>,
    cursor: AtomicUsize,
    next_id: AtomicU64,
    max_age: Duration,
    max_requests: u32,
}

impl<S: RawTransport> RawPool<S> {
    pub fn new(domain: &str, max_age: Duration, max_requests: u32) -> Self {
        Self {
            domain: domain.to_string(),
            conns: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            max_age,
            max_requests,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.lock().is_empty()
    }

    /// Append a freshly authenticated connection.
    pub fn add(&self, stream: S) -> Arc<RawConn<S>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(RawConn::new(id, stream));
        self.conns.lock().push(Arc::clone(&conn));
        debug!(domain = %self.domain, conn_id = id, "raw connection pooled");
        conn
    }

    /// Round-robin pick of a connection whose stream slot is free.
    pub fn get(&self) -> Option<Arc<RawConn<S>>> {
        let conns = self.conns.lock();
        if conns.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % conns.len();
        for i in 0..conns.len() {
            let conn = &conns[(start + i) % conns.len()];
            if conn.stream.lock().is_some() {
                return Some(Arc::clone(conn));
            }
        }
        None
    }

    /// Single-byte liveness probe. A read deadline expiring means the peer
    /// is simply quiet, i.e. alive; EOF or a socket error means dead. A
    /// connection currently borrowed counts as alive.
    ///
    /// The stream is taken out of its slot for the probe so no lock is
    /// held across the read.
    pub async fn probe(&self, conn: &RawConn<S>) -> bool {
        if conn.is_closed() {
            return false;
        }
        let Some(stream) = conn.stream.lock().take() else {
            return true;
        };
        let alive = probe_stream(&stream).await;
        if alive && !conn.is_closed() {
            *conn.stream.lock() = Some(stream);
        } else {
            conn.close();
        }
        alive
    }

    /// Remove and close a connection. Idempotent.
    pub fn remove(&self, conn: &Arc<RawConn<S>>) {
        self.conns.lock().retain(|c| !Arc::ptr_eq(c, conn));
        conn.close();
    }

    /// Whether a connection has exceeded its reuse budget.
    pub fn should_retire(&self, conn: &RawConn<S>) -> bool {
        conn.age() > self.max_age || conn.request_count() > self.max_requests
    }

    /// Return a borrowed stream. Retires the connection instead when its
    /// budget is spent or the caller observed a poisoning response.
    pub fn put_back(&self, conn: &Arc<RawConn<S>>, stream: S, force_retire: bool) {
        conn.mark_served();
        if force_retire || self.should_retire(conn) {
            trace!(domain = %self.domain, conn_id = conn.id, "raw connection retired");
            drop(stream);
            self.remove(conn);
            return;
        }
        *conn.stream.lock() = Some(stream);
    }

    /// Probe every connection, removing dead ones. Returns how many were
    /// removed.
    pub async fn sweep(&self) -> usize {
        let snapshot: Vec<Arc<RawConn<S>>> = self.conns.lock().clone();
        let mut removed = 0;
        for conn in snapshot {
            if !self.probe(&conn).await {
                self.remove(&conn);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(domain = %self.domain, removed, "raw pool swept");
        }
        removed
    }

    /// Close everything and empty the pool.
    pub fn close(&self) {
        let mut conns = self.conns.lock();
        for conn in conns.drain(..) {
            conn.close();
        }
    }
}

async fn probe_stream<S: RawTransport>(stream: &S) -> bool {
    let mut buf = [0u8; 1];
    match timeout(PROBE_DEADLINE, stream.tcp().peek(&mut buf)).await {
        Err(_) => true,     // deadline: no data, socket open
        Ok(Ok(0)) => false, // EOF
        Ok(Ok(_)) => true,  // bytes pending
        Ok(Err(_)) => false,
    }
}

/// Registry of per-domain pools.
pub struct RawPoolMap {
    pools: DashMap<String, Arc<RawPool>>,
    max_age: Duration,
    max_requests: u32,
}

impl RawPoolMap {
    pub fn new(max_age: Duration, max_requests: u32) -> Self {
        Self {
            pools: DashMap::new(),
            max_age,
            max_requests,
        }
    }

    pub fn pool(&self, domain: &str) -> Arc<RawPool> {
        self.pools
            .entry(domain.to_string())
            .or_insert_with(|| {
                Arc::new(RawPool::new(domain, self.max_age, self.max_requests))
            })
            .clone()
    }

    pub fn existing(&self, domain: &str) -> Option<Arc<RawPool>> {
        self.pools.get(domain).map(|e| Arc::clone(&e))
    }

    pub fn all(&self) -> Vec<Arc<RawPool>> {
        self.pools.iter().map(|e| Arc::clone(&e)).collect()
    }

    pub fn close_all(&self) {
        for entry in self.pools.iter() {
            entry.value().close();
        }
        self.pools.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn pool() -> RawPool<TcpStream> {
        RawPool::new("a.example", Duration::from_secs(600), 50)
    }

    #[tokio::test]
    async fn test_round_robin_rotation() {
        let pool = pool();
        let (c1, _k1) = tcp_pair().await;
        let (c2, _k2) = tcp_pair().await;
        let id1 = pool.add(c1).id;
        let id2 = pool.add(c2).id;
        let picks: Vec<u64> = (0..4).map(|_| pool.get().unwrap().id).collect();
        assert_eq!(picks[0] == id1, picks[2] == id1);
        assert_eq!(picks[1] == id2, picks[3] == id2);
        assert_ne!(picks[0], picks[1]);
    }

    #[tokio::test]
    async fn test_get_empty_returns_none() {
        assert!(pool().get().is_none());
    }

    #[tokio::test]
    async fn test_probe_alive_and_dead() {
        let pool = pool();
        let (client, server) = tcp_pair().await;
        let conn = pool.add(client);
        assert!(pool.probe(&conn).await);

        drop(server); // peer closes → EOF
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pool.probe(&conn).await);
    }

    #[tokio::test]
    async fn test_probe_with_pending_bytes_is_alive() {
        let pool = pool();
        let (client, mut server) = tcp_pair().await;
        let conn = pool.add(client);
        server.write_all(b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.probe(&conn).await);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let pool = pool();
        let (client, _k) = tcp_pair().await;
        let conn = pool.add(client);
        pool.remove(&conn);
        pool.remove(&conn);
        assert!(pool.is_empty());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_sweep_removes_dead() {
        let pool = pool();
        let (c1, _k1) = tcp_pair().await;
        let (c2, k2) = tcp_pair().await;
        pool.add(c1);
        pool.add(c2);
        drop(k2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.sweep().await, 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_retire_after_request_budget() {
        let pool = RawPool::new("a.example", Duration::from_secs(600), 1);
        let (client, _k) = tcp_pair().await;
        let conn = pool.add(client);
        let stream = conn.take_stream().unwrap();
        pool.put_back(&conn, stream, false);
        assert_eq!(pool.len(), 1);
        let stream = conn.take_stream().unwrap();
        pool.put_back(&conn, stream, false); // second return exceeds budget
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_force_retire_on_poisoned_response() {
        let pool = pool();
        let (client, _k) = tcp_pair().await;
        let conn = pool.add(client);
        let stream = conn.take_stream().unwrap();
        pool.put_back(&conn, stream, true);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_busy_connection_skipped() {
        let pool = pool();
        let (c1, _k1) = tcp_pair().await;
        let conn = pool.add(c1);
        let _borrowed = conn.take_stream().unwrap();
        assert!(pool.get().is_none());
    }

    #[tokio::test]
    async fn test_close_empties_pool() {
        let pool = pool();
        let (c1, _k1) = tcp_pair().await;
        let (c2, _k2) = tcp_pair().await;
        pool.add(c1);
        pool.add(c2);
        pool.close();
        assert!(pool.is_empty());
    }
}
