//! On-demand raw-byte connections.
//!
//! When the edge sends `Control::EstablishRequest`, the client dials the
//! raw tunnel port, authenticates with one handshake frame, and then
//! bridges opaque bytes between the edge and the local service. The local
//! connection is opened lazily on the first forwarded bytes, so a pooled
//! connection can idle without holding a local socket open.

use std::sync::Arc;
use std::time::Duration;

use giraffe_wire::{io as wire_io, ControlMessage, Frame, MsgType, TunnelState};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::state::AppState;

pub fn spawn_establish(state: Arc<AppState>, domain: String, request_id: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = establish(&state, &domain, request_id).await {
            warn!(domain = %domain, request_id, error = %e, "raw establishment failed");
        }
    })
}

async fn establish(state: &Arc<AppState>, domain: &str, request_id: u64) -> anyhow::Result<()> {
    let config = &state.config;
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);

    let tcp = timeout(
        connect_timeout,
        TcpStream::connect((config.server_host.as_str(), config.raw_port)),
    )
    .await
    .map_err(|_| anyhow::anyhow!("raw TCP connect timeout"))??;
    let _ = tcp.set_nodelay(true);

    let server_name = ServerName::try_from(config.server_host.clone())?;
    let connector = TlsConnector::from(Arc::clone(&state.tls));
    let mut stream = timeout(connect_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| anyhow::anyhow!("raw TLS handshake timeout"))??;

    let handshake = ControlMessage::Handshake {
        token: config.token.clone(),
        domain: Some(domain.to_string()),
        target_port: Some(state.settings.load().target_port),
        capabilities: vec!["raw".into()],
        client_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    wire_io::write_frame(
        &mut stream,
        &state.codec,
        &Frame::control(MsgType::Control, handshake.to_payload()?),
    )
    .await?;

    let reply = timeout(
        connect_timeout,
        wire_io::read_frame(&mut stream, &state.codec),
    )
    .await
    .map_err(|_| anyhow::anyhow!("raw handshake reply timeout"))??;
    match reply.msg_type {
        MsgType::Control => match ControlMessage::from_payload(&reply.payload)? {
            ControlMessage::Status {
                state: TunnelState::Connected,
                ..
            } => {}
            other => anyhow::bail!("unexpected raw handshake reply: {:?}", other),
        },
        MsgType::Error => {
            let err = giraffe_wire::ErrorPayload::from_payload(&reply.payload)?;
            anyhow::bail!("raw handshake rejected: {}", err.message);
        }
        other => anyhow::bail!("unexpected raw handshake frame: {:?}", other),
    }

    info!(domain = %domain, request_id, "raw connection established, waiting for traffic");

    // Block until the edge forwards the first upgrade bytes. EOF here just
    // means the pool retired us unused.
    let mut first = vec![0u8; 16 * 1024];
    let n = stream.read(&mut first).await?;
    if n == 0 {
        debug!(domain = %domain, "raw connection retired unused");
        return Ok(());
    }

    let settings = state.settings.load();
    let mut local = TcpStream::connect(("127.0.0.1", settings.target_port)).await?;
    let _ = local.set_nodelay(true);
    local.write_all(&first[..n]).await?;

    match tokio::io::copy_bidirectional(&mut stream, &mut local).await {
        Ok((from_edge, from_local)) => {
            info!(domain = %domain, from_edge, from_local, "raw stream closed");
            state.metrics.record_transfer(from_edge, from_local);
        }
        Err(e) => {
            debug!(domain = %domain, error = %e, "raw stream closed with error");
        }
    }
    Ok(())
}
