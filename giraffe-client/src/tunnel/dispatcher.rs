//! Frame dispatcher: reads incoming tunnel frames and routes them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use giraffe_wire::{ControlMessage, ErrorPayload, Frame, MsgType, RequestHead};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::state::AppState;

use super::writer::FrameSender;
use super::{forwarder, raw};

/// Cap on concurrently assembling chunked uploads.
const MAX_UPLOAD_STREAMS: usize = 128;

/// Buffer of body frames per upload stream.
const UPLOAD_CHANNEL_CAPACITY: usize = 64;

/// Run the dispatcher loop, reading from the WebSocket stream.
pub async fn run<S>(
    state: Arc<AppState>,
    mut ws_stream: S,
    frame_tx: FrameSender,
) -> Result<(), anyhow::Error>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send
        + 'static,
{
    // Chunked uploads being assembled: request_id -> body frame sender
    let mut uploads: HashMap<u64, mpsc::Sender<Frame>> = HashMap::new();
    let mut handler_handles: Vec<JoinHandle<()>> = Vec::new();
    let mut frames_since_cleanup: u32 = 0;
    let stale_timeout = Duration::from_secs(state.config.stale_timeout_secs);
    let mut last_data_at = tokio::time::Instant::now();

    let read_err = loop {
        let msg_result = tokio::select! {
            msg = ws_stream.next() => {
                match msg {
                    Some(r) => r,
                    None => break None,
                }
            }
            _ = tokio::time::sleep_until(last_data_at + stale_timeout) => {
                warn!(
                    stale_secs = stale_timeout.as_secs(),
                    "tunnel connection stale, no data received"
                );
                break None;
            }
        };

        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "tunnel read error");
                break Some(e);
            }
        };

        // Any received message proves the connection is alive
        last_data_at = tokio::time::Instant::now();

        let data = match msg {
            Message::Binary(data) => Bytes::from(data),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                info!("received tunnel close");
                break None;
            }
            _ => continue,
        };

        let frame = match state.codec.decode(data) {
            Ok(f) => f,
            Err(e) if e.is_recoverable() => {
                debug!(error = %e, "unknown frame tag dropped");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "malformed frame, closing stream");
                break None;
            }
        };

        match frame.msg_type {
            MsgType::HttpRequest => {
                let (head, body) = match parse_http(&frame) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(request_id = frame.request_id, error = %e, "invalid request frame");
                        continue;
                    }
                };
                let state_clone = Arc::clone(&state);
                let tx_clone = frame_tx.clone();
                let request_id = frame.request_id;
                handler_handles.push(tokio::spawn(async move {
                    forwarder::handle_request(state_clone, request_id, head, body, tx_clone)
                        .await;
                }));
                debug!(request_id = frame.request_id, "request dispatched");
            }

            MsgType::HttpRequestStart => {
                let (head, _) = match parse_http(&frame) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(request_id = frame.request_id, error = %e, "invalid request start");
                        continue;
                    }
                };
                if uploads.len() >= MAX_UPLOAD_STREAMS {
                    warn!(request_id = frame.request_id, "max concurrent uploads reached");
                    continue;
                }
                let (body_tx, body_rx) = mpsc::channel::<Frame>(UPLOAD_CHANNEL_CAPACITY);
                uploads.insert(frame.request_id, body_tx);

                let state_clone = Arc::clone(&state);
                let tx_clone = frame_tx.clone();
                let request_id = frame.request_id;
                handler_handles.push(tokio::spawn(async move {
                    forwarder::handle_streaming_request(
                        state_clone,
                        request_id,
                        head,
                        body_rx,
                        tx_clone,
                    )
                    .await;
                }));
                debug!(request_id = frame.request_id, "upload stream started");
            }

            MsgType::HttpRequestChunk => {
                if let Some(tx) = uploads.get(&frame.request_id) {
                    // bounded channel: blocking here backpressures the read
                    // loop against a slow local service
                    let _ = tx.send(frame).await;
                }
            }

            MsgType::HttpRequestEnd => {
                if let Some(tx) = uploads.remove(&frame.request_id) {
                    let _ = tx.send(frame).await;
                }
            }

            MsgType::Control => match ControlMessage::from_payload(&frame.payload) {
                Ok(ControlMessage::EstablishRequest {
                    domain, request_id, ..
                }) => {
                    info!(domain = %domain, request_id, "raw connection requested");
                    handler_handles.push(raw::spawn_establish(
                        Arc::clone(&state),
                        domain,
                        request_id,
                    ));
                }
                Ok(status @ ControlMessage::Status { .. }) => {
                    *state.last_status.lock().unwrap() = Some(status);
                }
                Ok(ControlMessage::Config {
                    target_port,
                    chunk_threshold,
                }) => {
                    info!(?target_port, ?chunk_threshold, "remote config applied");
                    state.apply_remote_settings(target_port, chunk_threshold);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "undecodable control frame dropped");
                }
            },

            MsgType::Error => {
                if let Some(tx) = uploads.remove(&frame.request_id) {
                    // abort the upload body
                    let _ = tx.send(frame).await;
                } else if let Ok(err) = ErrorPayload::from_payload(&frame.payload) {
                    warn!(
                        request_id = frame.request_id,
                        code = ?err.code,
                        message = %err.message,
                        "edge error frame"
                    );
                }
            }

            other => {
                debug!(msg_type = ?other, "ignoring unexpected frame type");
            }
        }

        // Periodic cleanup of finished handles to avoid unbounded growth
        frames_since_cleanup += 1;
        if frames_since_cleanup >= 64 || handler_handles.len() > MAX_UPLOAD_STREAMS {
            handler_handles.retain(|h| !h.is_finished());
            frames_since_cleanup = 0;
        }
    };

    // Reconnect starts clean: drop upload senders so forwarders unblock
    uploads.clear();

    drain_handlers(handler_handles).await;

    match read_err {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn parse_http(frame: &Frame) -> Result<(RequestHead, Bytes), giraffe_wire::ProtocolError> {
    let (head_json, body) = frame.split_head()?;
    let head: RequestHead =
        serde_json::from_slice(&head_json).map_err(giraffe_wire::ProtocolError::BadHead)?;
    Ok((head, body))
}

/// Wait for active handlers to finish (with a timeout) so their frame_tx
/// clones are dropped before the writer closes the sink.
async fn drain_handlers(handles: Vec<JoinHandle<()>>) {
    if handles.is_empty() {
        return;
    }
    let count = handles.len();
    debug!(count, "waiting for active handlers to finish");
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        for h in handles {
            let _ = h.await;
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use giraffe_wire::flags;

    #[test]
    fn test_parse_http_frame() {
        let head = RequestHead {
            method: "GET".into(),
            path: "/hello".into(),
            headers: vec![("Host".into(), "a.example".into())],
            content_length: None,
            client_ip: Some("203.0.113.9".into()),
        };
        let frame =
            Frame::http(9, MsgType::HttpRequest, flags::END_STREAM, Some(&head), b"body").unwrap();
        let (parsed, body) = parse_http(&frame).unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.path, "/hello");
        assert_eq!(&body[..], b"body");
    }

    #[test]
    fn test_parse_http_rejects_missing_head() {
        let frame = Frame::new(9, MsgType::HttpRequest, 0, Bytes::new());
        assert!(parse_http(&frame).is_err());
    }
}
