//! Tunnel client: connect, handshake, and run until disconnected.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use giraffe_wire::{ControlMessage, ErrorPayload, Frame, MsgType, TunnelState};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::state::AppState;

use super::{dispatcher, monitor, writer};

/// Keep-alive ping cadence on the RPC transport.
const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of a tunnel session.
pub enum TunnelOutcome {
    /// Graceful shutdown requested by the local process.
    Shutdown,
    /// Remote side disconnected or connection lost; caller reconnects.
    Disconnected,
}

/// Connect to the edge RPC port and run until disconnected.
pub async fn connect_and_run(
    state: &Arc<AppState>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<TunnelOutcome, anyhow::Error> {
    let config = &state.config;
    let ws_url = format!("wss://{}:{}/tunnel", config.server_host, config.server_port);
    info!(url = %ws_url, "connecting tunnel");

    let mut request = ws_url.clone().into_client_request()?;
    request.headers_mut().insert(
        "X-GiraffeCloud-Version",
        http::HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );

    // Re-resolve the hostname on every attempt
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
    let tcp_stream = tokio::time::timeout(
        connect_timeout,
        TcpStream::connect((config.server_host.as_str(), config.server_port)),
    )
    .await
    .map_err(|_| anyhow::anyhow!("tunnel TCP connect timeout ({}s)", connect_timeout.as_secs()))??;

    configure_tcp_socket(&tcp_stream);

    let ws_config = WebSocketConfig {
        max_frame_size: Some(state.codec.max_frame() + 1024),
        max_message_size: Some(state.codec.max_frame() + 1024),
        ..Default::default()
    };
    let connector = tokio_tungstenite::Connector::Rustls(Arc::clone(&state.tls));
    let (ws_stream, _response) = tokio::time::timeout(
        connect_timeout,
        tokio_tungstenite::client_async_tls_with_config(
            request,
            tcp_stream,
            Some(ws_config),
            Some(connector),
        ),
    )
    .await
    .map_err(|_| anyhow::anyhow!("tunnel TLS handshake timeout ({}s)", connect_timeout.as_secs()))??;

    let (ws_sink, mut ws_read) = ws_stream.split();
    let (frame_tx, mut writer_handle) = writer::spawn_writer(ws_sink, state.codec, PING_INTERVAL);

    // Handshake is always the first frame on the stream
    let handshake = ControlMessage::Handshake {
        token: config.token.clone(),
        domain: config.domain.clone(),
        target_port: Some(config.local_port),
        capabilities: vec!["chunked".into(), "raw".into()],
        client_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    frame_tx
        .send(Frame::control(MsgType::Control, handshake.to_payload()?))
        .await
        .map_err(|_| anyhow::anyhow!("writer closed before handshake"))?;

    wait_for_connected(state, &mut ws_read).await?;
    info!(
        domain = config.domain.as_deref().unwrap_or("<auto>"),
        local_port = config.local_port,
        "tunnel connected"
    );
    state.metrics.record_reconnect();

    let monitor_handle = monitor::spawn(Arc::clone(state), frame_tx.clone(), shutdown.clone());

    // Watch the writer too: if the write half dies while the read half
    // stays open, the dispatcher would block forever on the next frame.
    let state_clone = Arc::clone(state);
    let outcome = tokio::select! {
        result = dispatcher::run(state_clone, ws_read, frame_tx.clone()) => {
            match result {
                Ok(()) => TunnelOutcome::Disconnected,
                Err(e) => return Err(e),
            }
        }
        writer_result = &mut writer_handle => {
            match writer_result {
                Ok(()) => warn!("writer task exited, triggering reconnect"),
                Err(e) => warn!(error = %e, "writer task failed, triggering reconnect"),
            }
            TunnelOutcome::Disconnected
        }
        _ = shutdown.changed() => {
            debug!("shutdown during tunnel dispatch");
            TunnelOutcome::Shutdown
        }
    };

    monitor_handle.abort();
    drop(frame_tx);

    if !writer_handle.is_finished() {
        let _ = tokio::time::timeout(Duration::from_secs(35), writer_handle).await;
    }

    info!("tunnel disconnected");
    Ok(outcome)
}

/// Wait for the edge's Status(Connected); auth failures surface here.
async fn wait_for_connected<S>(state: &Arc<AppState>, ws_read: &mut S) -> anyhow::Result<()>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let deadline = Duration::from_secs(10);
    loop {
        let msg = tokio::time::timeout(deadline, ws_read.next())
            .await
            .map_err(|_| anyhow::anyhow!("no handshake response from edge"))?
            .ok_or_else(|| anyhow::anyhow!("edge closed the stream during handshake"))?;

        let data = match msg? {
            Message::Binary(data) => Bytes::from(data),
            Message::Close(_) => anyhow::bail!("edge closed the stream during handshake"),
            _ => continue,
        };
        let frame = match state.codec.decode(data) {
            Ok(f) => f,
            Err(e) if e.is_recoverable() => continue,
            Err(e) => return Err(e.into()),
        };
        match frame.msg_type {
            MsgType::Control => match ControlMessage::from_payload(&frame.payload)? {
                ControlMessage::Status {
                    state: TunnelState::Connected,
                    domain,
                    target_port,
                    ..
                } => {
                    debug!(domain = %domain, target_port, "edge confirmed session");
                    return Ok(());
                }
                ControlMessage::Status {
                    state: TunnelState::Closed,
                    error_message,
                    ..
                } => {
                    anyhow::bail!(
                        "edge rejected session: {}",
                        error_message.unwrap_or_else(|| "unknown".into())
                    );
                }
                _ => continue,
            },
            MsgType::Error => {
                let err = ErrorPayload::from_payload(&frame.payload)?;
                anyhow::bail!("edge rejected session: {}", err.message);
            }
            _ => continue,
        }
    }
}

/// Configure TCP keepalive and NODELAY on an established socket.
fn configure_tcp_socket(stream: &TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(5));
    #[cfg(not(target_os = "windows"))]
    let keepalive = keepalive.with_retries(3);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to set TCP keepalive on tunnel socket");
    }

    if let Err(e) = sock_ref.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY on tunnel socket");
    }
}
