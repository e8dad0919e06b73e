//! In-memory state for live RPC tunnel sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use giraffe_wire::{frame, ErrorCode, ErrorPayload, Frame, MsgType};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Capacity of a per-request response sink.
pub const SINK_CAPACITY: usize = 64;

/// Capacity of the per-session writer channel.
pub const WRITER_CAPACITY: usize = 256;

/// One authenticated RPC stream on the edge.
///
/// Owned by the sessions map; the hybrid router borrows it for the duration
/// of one proxied request.
pub struct TunnelSession {
    pub domain: String,
    pub tunnel_id: i64,
    pub user_id: i64,
    pub target_port: u16,
    pub client_ip: String,
    pub connected_at_ms: u64,
    last_activity_ms: AtomicU64,
    next_request_id: AtomicU64,
    frame_tx: mpsc::Sender<Frame>,
    pending: DashMap<u64, mpsc::Sender<Frame>>,
    dropped_frames: AtomicU64,
    cancel_tx: watch::Sender<bool>,
}

impl TunnelSession {
    pub fn new(
        domain: String,
        tunnel_id: i64,
        user_id: i64,
        target_port: u16,
        client_ip: String,
        frame_tx: mpsc::Sender<Frame>,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let now = frame::now_unix_ms();
        Self {
            domain,
            tunnel_id,
            user_id,
            target_port,
            client_ip,
            connected_at_ms: now,
            last_activity_ms: AtomicU64::new(now),
            next_request_id: AtomicU64::new(1),
            frame_tx,
            pending: DashMap::new(),
            dropped_frames: AtomicU64::new(0),
            cancel_tx,
        }
    }

    /// Record client activity on this session.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(frame::now_unix_ms(), Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms();
        Duration::from_millis(frame::now_unix_ms().saturating_sub(last))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Watch that flips when this session is superseded or torn down.
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Allocate a request id and its response sink.
    pub fn register_request(&self) -> (u64, mpsc::Receiver<Frame>) {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        self.pending.insert(id, tx);
        (id, rx)
    }

    /// Remove a request sink. Safe to call more than once.
    pub fn complete_request(&self, request_id: u64) {
        self.pending.remove(&request_id);
    }

    /// Route a client frame to its request sink.
    ///
    /// Frames for unknown requests (late chunks after sink removal) are
    /// dropped silently; frames that would overflow a full sink are dropped
    /// and counted so the consumer can keep making progress.
    pub fn deliver(&self, frame: Frame) {
        let request_id = frame.request_id;
        let Some(sink) = self.pending.get(&request_id) else {
            debug!(request_id, domain = %self.domain, "late frame dropped");
            return;
        };
        if let Err(e) = sink.try_send(frame) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    warn!(request_id, domain = %self.domain, "sink full, frame dropped");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!(request_id, domain = %self.domain, "sink closed, frame dropped");
                }
            }
        }
    }

    /// Queue a frame for the stream writer.
    pub async fn send(&self, frame: Frame) -> Result<(), SessionGone> {
        self.frame_tx.send(frame).await.map_err(|_| SessionGone)
    }

    /// Cancel the session and fail every pending sink with the given code.
    pub fn cancel(&self, code: ErrorCode, message: &str) {
        let _ = self.cancel_tx.send(true);
        self.drain_pending(code, message);
    }

    fn drain_pending(&self, code: ErrorCode, message: &str) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, sink)) = self.pending.remove(&id) {
                let payload = ErrorPayload::new(code, message, true)
                    .to_payload()
                    .unwrap_or_default();
                let _ = sink.try_send(Frame::new(id, MsgType::Error, 0, payload));
            }
        }
    }
}

/// The session stream ended while a request was in flight.
#[derive(Debug)]
pub struct SessionGone;

/// Process-wide `domain → session` map. At most one session per domain; a
/// replacement atomically supersedes the old one.
#[derive(Clone, Default)]
pub struct SessionMap {
    inner: Arc<DashMap<String, Arc<TunnelSession>>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, domain: &str) -> Option<Arc<TunnelSession>> {
        self.inner.get(domain).map(|e| Arc::clone(&e))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn domains(&self) -> Vec<String> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }

    /// Install a session, cancelling and returning any predecessor.
    pub fn insert_replacing(&self, session: Arc<TunnelSession>) -> Option<Arc<TunnelSession>> {
        let old = self.inner.insert(session.domain.clone(), session);
        if let Some(ref old_session) = old {
            old_session.cancel(ErrorCode::TunnelDisconnected, "session replaced");
        }
        old
    }

    /// Remove the entry only if it still holds this exact session.
    ///
    /// Returns true when the caller was the current holder and is therefore
    /// responsible for route withdrawal.
    pub fn remove_if_current(&self, session: &Arc<TunnelSession>) -> bool {
        self.inner
            .remove_if(&session.domain, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    /// Cancel every session (shutdown path).
    pub fn cancel_all(&self, message: &str) {
        for entry in self.inner.iter() {
            entry.value().cancel(ErrorCode::TunnelDisconnected, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use giraffe_wire::flags;

    fn session(domain: &str) -> (Arc<TunnelSession>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(WRITER_CAPACITY);
        (
            Arc::new(TunnelSession::new(
                domain.into(),
                1,
                1,
                8080,
                "203.0.113.9".into(),
                tx,
            )),
            rx,
        )
    }

    #[tokio::test]
    async fn test_request_ids_are_unique() {
        let (s, _rx) = session("a.example");
        let (id1, _r1) = s.register_request();
        let (id2, _r2) = s.register_request();
        assert_ne!(id1, id2);
        assert_eq!(s.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_deliver_routes_by_request_id() {
        let (s, _rx) = session("a.example");
        let (id, mut sink) = s.register_request();
        s.deliver(Frame::new(id, MsgType::HttpResponse, flags::END_STREAM, "ok"));
        let frame = sink.recv().await.unwrap();
        assert_eq!(frame.request_id, id);
        assert!(frame.is_end_stream());
    }

    #[tokio::test]
    async fn test_late_frame_dropped_silently() {
        let (s, _rx) = session("a.example");
        let (id, sink) = s.register_request();
        s.complete_request(id);
        drop(sink);
        // must not panic or block
        s.deliver(Frame::new(id, MsgType::HttpResponse, 0, "late"));
        assert_eq!(s.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_full_sink_drops_and_counts() {
        let (s, _rx) = session("a.example");
        let (id, _sink) = s.register_request();
        for _ in 0..SINK_CAPACITY + 3 {
            s.deliver(Frame::new(id, MsgType::HttpResponse, flags::CHUNKED, "x"));
        }
        assert_eq!(s.dropped_frames(), 3);
    }

    #[tokio::test]
    async fn test_cancel_drains_pending_with_error() {
        let (s, _rx) = session("a.example");
        let (_id, mut sink) = s.register_request();
        s.cancel(ErrorCode::TunnelDisconnected, "gone");
        let frame = sink.recv().await.unwrap();
        assert_eq!(frame.msg_type, MsgType::Error);
        let err = ErrorPayload::from_payload(&frame.payload).unwrap();
        assert_eq!(err.code, ErrorCode::TunnelDisconnected);
        assert_eq!(s.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_map_single_entry_per_domain() {
        let map = SessionMap::new();
        let (s1, _rx1) = session("a.example");
        let (s2, _rx2) = session("a.example");
        assert!(map.insert_replacing(Arc::clone(&s1)).is_none());
        let old = map.insert_replacing(Arc::clone(&s2)).unwrap();
        assert!(Arc::ptr_eq(&old, &s1));
        assert!(old.is_cancelled());
        assert_eq!(map.len(), 1);
        assert!(Arc::ptr_eq(&map.get("a.example").unwrap(), &s2));
    }

    #[tokio::test]
    async fn test_remove_if_current_ignores_superseded() {
        let map = SessionMap::new();
        let (s1, _rx1) = session("a.example");
        let (s2, _rx2) = session("a.example");
        map.insert_replacing(Arc::clone(&s1));
        map.insert_replacing(Arc::clone(&s2));
        // the superseded session must not remove its replacement
        assert!(!map.remove_if_current(&s1));
        assert!(map.get("a.example").is_some());
        assert!(map.remove_if_current(&s2));
        assert!(map.get("a.example").is_none());
    }
}
