//! Streaming RPC tunnel server (Port A).
//!
//! Lifecycle per stream: accept → handshake (first frame, or the stream is
//! closed) → authenticate → publish route → register session → serve loop.
//! Teardown unregisters the session, drains its pending sinks, and
//! withdraws the route.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use giraffe_wire::{
    frame, ControlMessage, ErrorCode, ErrorPayload, Frame, MsgType, TunnelState,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::EdgeConfig;
use crate::session::{TunnelSession, WRITER_CAPACITY};
use crate::state::EdgeState;

/// Deadline for TLS + WebSocket + handshake frame on a fresh stream.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket keep-alive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(5);

pub async fn run(
    state: Arc<EdgeState>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.rpc_port));
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "rpc tunnel server listening (mutual TLS)");

    let mut shutdown_accept = shutdown.clone();
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to accept rpc connection");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_conn(state, stream, peer_addr, shutdown).await {
                        debug!(peer = %peer_addr, error = %e, "rpc stream ended with error");
                    }
                });
            }
            _ = shutdown_accept.changed() => {
                info!("rpc tunnel server shutting down");
                state.sessions.cancel_all("edge shutting down");
                return Ok(());
            }
        }
    }
}

/// Configure TCP keepalive and NODELAY on a tunnel socket.
pub fn tune_socket(stream: &TcpStream, config: &EdgeConfig) {
    let sock_ref = socket2::SockRef::from(stream);

    if config.tcp_keepalive_secs > 0 {
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(config.tcp_keepalive_secs))
            .with_interval(Duration::from_secs(5));
        #[cfg(not(target_os = "windows"))]
        let keepalive = keepalive.with_retries(3);
        if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
            warn!(error = %e, "failed to set TCP keepalive on tunnel socket");
        }
    }

    if let Err(e) = sock_ref.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY on tunnel socket");
    }
}

async fn handle_conn(
    state: Arc<EdgeState>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tune_socket(&stream, &state.config);

    let tls_stream = timeout(
        Duration::from_secs(state.config.tls_handshake_timeout_secs),
        state.rpc_acceptor.accept(stream),
    )
    .await
    .map_err(|_| anyhow::anyhow!("TLS handshake timeout"))??;

    let ws_config = WebSocketConfig {
        max_frame_size: Some(state.codec.max_frame() + 1024),
        max_message_size: Some(state.codec.max_frame() + 1024),
        ..Default::default()
    };
    let ws_stream = timeout(
        HANDSHAKE_TIMEOUT,
        tokio_tungstenite::accept_async_with_config(tls_stream, Some(ws_config)),
    )
    .await
    .map_err(|_| anyhow::anyhow!("WebSocket handshake timeout"))??;

    let (ws_sink, mut ws_read) = ws_stream.split();
    let (frame_tx, writer_handle) = spawn_writer(ws_sink, Arc::clone(&state));

    // Handshake must be the first frame; anything else is a protocol
    // violation and no route is published.
    let handshake = match timeout(HANDSHAKE_TIMEOUT, next_frame(&mut ws_read, &state)).await {
        Ok(Some(frame)) => frame,
        Ok(None) => anyhow::bail!("stream closed before handshake"),
        Err(_) => {
            send_error(&frame_tx, 0, ErrorCode::HandshakeRequired, "handshake timeout").await;
            anyhow::bail!("handshake timeout");
        }
    };

    let (token, requested_domain, client_target_port) = match parse_handshake(&handshake) {
        Some(v) => v,
        None => {
            send_error(
                &frame_tx,
                0,
                ErrorCode::HandshakeRequired,
                "first frame must be a handshake",
            )
            .await;
            anyhow::bail!("first frame was not a handshake");
        }
    };

    let record = match state
        .auth
        .authenticate(&token, requested_domain.as_deref())
        .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "tunnel auth failed");
            let status = ControlMessage::Status {
                state: TunnelState::Closed,
                domain: requested_domain.unwrap_or_default(),
                target_port: 0,
                connected_at_ms: 0,
                last_activity_ms: frame::now_unix_ms(),
                error_message: Some(e.to_string()),
            };
            send_control(&frame_tx, &status).await;
            send_error(&frame_tx, 0, ErrorCode::AuthFailed, &e.to_string()).await;
            drop(frame_tx);
            let _ = writer_handle.await;
            return Ok(());
        }
    };

    if let Some(port) = client_target_port {
        if port != record.target_port {
            debug!(
                domain = %record.domain,
                requested = port,
                recorded = record.target_port,
                "handshake target port differs from tunnel record, using record"
            );
        }
    }

    let client_ip = peer_addr.ip().to_string();
    if let Err(e) = state.auth.record_client_ip(record.id, &client_ip).await {
        warn!(domain = %record.domain, error = %e, "failed to record client ip");
    }

    let upstream = state.config.route_upstream(&client_ip, record.target_port);
    if let Err(e) = state.publisher.publish(&record.domain, &upstream).await {
        error!(domain = %record.domain, error = %e, "route publish failed, closing stream");
        send_error(&frame_tx, 0, ErrorCode::Internal, "route publish failed").await;
        drop(frame_tx);
        let _ = writer_handle.await;
        return Ok(());
    }

    let session = Arc::new(TunnelSession::new(
        record.domain.clone(),
        record.id,
        record.user_id,
        record.target_port,
        client_ip,
        frame_tx.clone(),
    ));
    let replaced = state.sessions.insert_replacing(Arc::clone(&session));
    if replaced.is_some() {
        info!(domain = %record.domain, "existing session superseded");
    }

    send_control(&frame_tx, &status_message(&session, TunnelState::Connected, None)).await;
    info!(
        domain = %record.domain,
        peer = %peer_addr,
        target_port = record.target_port,
        "tunnel session connected"
    );

    let result = serve_loop(&state, &session, &frame_tx, &mut ws_read, shutdown).await;

    // Only the current holder withdraws the route; a superseded session
    // must not tear down its replacement.
    if state.sessions.remove_if_current(&session) {
        session.cancel(ErrorCode::TunnelDisconnected, "tunnel disconnected");
        if let Err(e) = state.publisher.withdraw(&record.domain).await {
            error!(domain = %record.domain, error = %e, "route withdraw failed");
        }
        state.rate.forget(&record.domain);
    }

    drop(frame_tx);
    let _ = timeout(Duration::from_secs(5), writer_handle).await;

    info!(
        domain = %record.domain,
        dropped_frames = session.dropped_frames(),
        "tunnel session closed"
    );
    result
}

async fn serve_loop<S>(
    state: &Arc<EdgeState>,
    session: &Arc<TunnelSession>,
    frame_tx: &mpsc::Sender<Frame>,
    ws_read: &mut S,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut cancelled = session.cancelled();
    let status_interval = Duration::from_secs(state.config.status_interval_secs);
    let idle_timeout = Duration::from_secs(state.config.idle_timeout_secs);
    let mut ticker = tokio::time::interval(status_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            msg = ws_read.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!(domain = %session.domain, error = %e, "rpc stream read error");
                        return Err(e.into());
                    }
                    None => return Ok(()),
                };
                match msg {
                    Message::Binary(data) => {
                        session.touch();
                        if !dispatch_frame(state, session, Bytes::from(data)) {
                            anyhow::bail!("fatal protocol error on rpc stream");
                        }
                    }
                    Message::Ping(_) | Message::Pong(_) => session.touch(),
                    Message::Close(_) => {
                        info!(domain = %session.domain, "client closed rpc stream");
                        return Ok(());
                    }
                    _ => {}
                }
            }
            _ = ticker.tick() => {
                if session.idle_for() > idle_timeout {
                    warn!(domain = %session.domain, "tunnel idle, closing");
                    send_error(frame_tx, 0, ErrorCode::TunnelIdle, "no activity on tunnel").await;
                    return Ok(());
                }
                send_control(
                    frame_tx,
                    &status_message(session, TunnelState::Connected, None),
                ).await;
            }
            _ = cancelled.changed() => {
                debug!(domain = %session.domain, "session superseded, exiting serve loop");
                return Ok(());
            }
            _ = shutdown.changed() => {
                info!(domain = %session.domain, "shutdown requested, closing session");
                return Ok(());
            }
        }
    }
}

/// Returns false on a fatal protocol error.
fn dispatch_frame(state: &Arc<EdgeState>, session: &Arc<TunnelSession>, data: Bytes) -> bool {
    let frame = match state.codec.decode(data) {
        Ok(f) => f,
        Err(e) if e.is_recoverable() => {
            debug!(domain = %session.domain, error = %e, "unknown frame tag dropped");
            return true;
        }
        Err(e) => {
            warn!(domain = %session.domain, error = %e, "malformed frame, closing stream");
            return false;
        }
    };

    match frame.msg_type {
        MsgType::HttpResponse | MsgType::Error if frame.request_id != 0 => {
            session.deliver(frame);
        }
        MsgType::Error => {
            if let Ok(err) = ErrorPayload::from_payload(&frame.payload) {
                warn!(domain = %session.domain, code = ?err.code, message = %err.message, "client error frame");
            }
        }
        MsgType::Control => match ControlMessage::from_payload(&frame.payload) {
            Ok(ControlMessage::Metrics {
                active_streams,
                total_requests,
                ..
            }) => {
                debug!(
                    domain = %session.domain,
                    active_streams,
                    total_requests,
                    "client metrics"
                );
            }
            Ok(ControlMessage::Status { .. }) => {}
            Ok(ControlMessage::Handshake { .. }) => {
                debug!(domain = %session.domain, "duplicate handshake ignored");
            }
            Ok(_) => {}
            Err(e) => {
                debug!(domain = %session.domain, error = %e, "undecodable control frame dropped");
            }
        },
        other => {
            debug!(domain = %session.domain, msg_type = ?other, "unexpected frame type dropped");
        }
    }
    true
}

async fn send_control(tx: &mpsc::Sender<Frame>, msg: &ControlMessage) {
    if let Ok(payload) = msg.to_payload() {
        let _ = tx.send(Frame::control(MsgType::Control, payload)).await;
    }
}

async fn send_error(tx: &mpsc::Sender<Frame>, request_id: u64, code: ErrorCode, message: &str) {
    if let Ok(payload) = ErrorPayload::new(code, message, false).to_payload() {
        let _ = tx.send(Frame::new(request_id, MsgType::Error, 0, payload)).await;
    }
}

fn status_message(
    session: &TunnelSession,
    state: TunnelState,
    error_message: Option<String>,
) -> ControlMessage {
    ControlMessage::Status {
        state,
        domain: session.domain.clone(),
        target_port: session.target_port,
        connected_at_ms: session.connected_at_ms,
        last_activity_ms: session.last_activity_ms(),
        error_message,
    }
}

fn parse_handshake(frame: &Frame) -> Option<(String, Option<String>, Option<u16>)> {
    if frame.msg_type != MsgType::Control {
        return None;
    }
    match ControlMessage::from_payload(&frame.payload) {
        Ok(ControlMessage::Handshake {
            token,
            domain,
            target_port,
            ..
        }) => Some((token, domain, target_port)),
        _ => None,
    }
}

/// Pull the next binary frame off the WebSocket, skipping pings.
async fn next_frame<S>(ws_read: &mut S, state: &Arc<EdgeState>) -> Option<Frame>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = ws_read.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                return state.codec.decode(Bytes::from(data)).ok();
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

/// Spawn the per-stream writer task: all frame writes funnel through one
/// channel, with WebSocket pings on the keep-alive cadence.
fn spawn_writer<S>(
    mut sink: S,
    state: Arc<EdgeState>,
) -> (mpsc::Sender<Frame>, JoinHandle<()>)
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Frame>(WRITER_CAPACITY);

    let handle = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await;
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let data = match state.codec.encode(&frame) {
                        Ok(d) => d,
                        Err(e) => {
                            error!(error = %e, "frame exceeds cap, dropped");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Binary(data.into())).await {
                        error!(error = %e, "failed to write frame to rpc stream");
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("rpc writer task exiting");
        let _ = sink.close().await;
    });

    (tx, handle)
}
