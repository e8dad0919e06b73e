//! Raw-byte tunnel server (Port B).
//!
//! Client agents dial in, authenticate with a single handshake frame, and
//! the connection then sits in the per-domain pool waiting to carry an
//! opaque byte stream (WebSocket upgrade-forward).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use giraffe_wire::{
    frame, io as wire_io, ControlMessage, ErrorCode, ErrorPayload, Frame, MsgType, TunnelState,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::AuthError;
use crate::state::EdgeState;

/// How long a fresh connection gets to complete TLS + handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(
    state: Arc<EdgeState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.raw_port));
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "raw tunnel server listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to accept raw connection");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_conn(state, stream, peer_addr).await {
                        debug!(peer = %peer_addr, error = %e, "raw connection rejected");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("raw tunnel server shutting down");
                state.pools.close_all();
                return Ok(());
            }
        }
    }
}

async fn handle_conn(
    state: Arc<EdgeState>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> anyhow::Result<()> {
    crate::rpc::server::tune_socket(&stream, &state.config);

    let mut tls_stream = timeout(
        Duration::from_secs(state.config.tls_handshake_timeout_secs),
        state.raw_acceptor.accept(stream),
    )
    .await
    .map_err(|_| anyhow::anyhow!("TLS handshake timeout"))??;

    let handshake = timeout(
        HANDSHAKE_TIMEOUT,
        wire_io::read_frame(&mut tls_stream, &state.codec),
    )
    .await
    .map_err(|_| anyhow::anyhow!("handshake timeout"))??;

    let (token, domain) = match parse_handshake(&handshake) {
        Some(v) => v,
        None => {
            reject(
                &state,
                &mut tls_stream,
                ErrorCode::HandshakeRequired,
                "first frame must be a handshake with a domain",
            )
            .await;
            anyhow::bail!("raw stream without handshake");
        }
    };

    let record = match state.auth.authenticate(&token, Some(&domain)).await {
        Ok(r) => r,
        Err(e @ AuthError::Store(_)) => {
            reject(&state, &mut tls_stream, ErrorCode::Internal, &e.to_string()).await;
            return Err(e.into());
        }
        Err(e) => {
            reject(&state, &mut tls_stream, ErrorCode::AuthFailed, &e.to_string()).await;
            anyhow::bail!("raw auth failed for {}: {}", domain, e);
        }
    };

    let status = ControlMessage::Status {
        state: TunnelState::Connected,
        domain: record.domain.clone(),
        target_port: record.target_port,
        connected_at_ms: frame::now_unix_ms(),
        last_activity_ms: frame::now_unix_ms(),
        error_message: None,
    };
    wire_io::write_frame(
        &mut tls_stream,
        &state.codec,
        &Frame::control(MsgType::Control, status.to_payload()?),
    )
    .await?;

    let pool = state.pools.pool(&record.domain);
    let conn = pool.add(tls_stream);
    let resolved = state.upgrades.notify(&record.domain);
    info!(
        domain = %record.domain,
        peer = %peer_addr,
        conn_id = conn.id,
        pool_size = pool.len(),
        resolved_waiter = resolved,
        "raw connection established"
    );
    Ok(())
}

fn parse_handshake(frame: &Frame) -> Option<(String, String)> {
    if frame.msg_type != MsgType::Control {
        return None;
    }
    match ControlMessage::from_payload(&frame.payload) {
        Ok(ControlMessage::Handshake { token, domain, .. }) => {
            domain.map(|d| (token, d))
        }
        _ => None,
    }
}

async fn reject<S>(state: &EdgeState, stream: &mut S, code: ErrorCode, message: &str)
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let payload = ErrorPayload::new(code, message, false)
        .to_payload()
        .unwrap_or_default();
    let _ = wire_io::write_frame(
        stream,
        &state.codec,
        &Frame::control(MsgType::Error, payload),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_handshake_requires_domain() {
        let hs = ControlMessage::Handshake {
            token: "tok".into(),
            domain: None,
            target_port: None,
            capabilities: vec![],
            client_version: "0.3.0".into(),
        };
        let frame = Frame::control(MsgType::Control, hs.to_payload().unwrap());
        assert!(parse_handshake(&frame).is_none());

        let hs = ControlMessage::Handshake {
            token: "tok".into(),
            domain: Some("a.example".into()),
            target_port: None,
            capabilities: vec![],
            client_version: "0.3.0".into(),
        };
        let frame = Frame::control(MsgType::Control, hs.to_payload().unwrap());
        assert_eq!(
            parse_handshake(&frame),
            Some(("tok".into(), "a.example".into()))
        );
    }

    #[test]
    fn test_non_control_frame_is_not_handshake() {
        let frame = Frame::new(1, MsgType::HttpRequestChunk, 0, "data");
        assert!(parse_handshake(&frame).is_none());
    }
}
