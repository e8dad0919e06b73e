//! Per-request forwarder: executes proxied requests against the local
//! service and answers in frames.
//!
//! Small responses go back as one terminal `HttpResponse`. Large ones
//! (by size, extension, or path shape) stream as an ordered chunk
//! sequence whose last frame carries the end-stream flag.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use giraffe_wire::{
    decompress_if_gzip, flags, ErrorCode, ErrorPayload, Frame, MsgType, RequestHead, ResponseHead,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::AppState;

use super::chunker::{self, CHUNK_SIZE};
use super::writer::FrameSender;

/// Handle a single-frame request.
pub async fn handle_request(
    state: Arc<AppState>,
    request_id: u64,
    head: RequestHead,
    body: Bytes,
    frame_tx: FrameSender,
) {
    state.metrics.stream_started();
    let bytes_in = body.len() as u64;
    execute(&state, request_id, head, reqwest::Body::from(body), &frame_tx).await;
    state.metrics.record_transfer(bytes_in, 0);
    state.metrics.stream_finished();
}

/// Handle a chunked upload: body frames arrive on `body_rx` and are piped
/// into the local request in order, never buffering the whole body.
pub async fn handle_streaming_request(
    state: Arc<AppState>,
    request_id: u64,
    head: RequestHead,
    body_rx: mpsc::Receiver<Frame>,
    frame_tx: FrameSender,
) {
    state.metrics.stream_started();

    let received = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&received);
    let stream = futures_util::stream::unfold(body_rx, move |mut rx| {
        let counter = Arc::clone(&counter);
        async move {
            let frame = rx.recv().await?;
            match frame.msg_type {
                MsgType::HttpRequestChunk => {
                    let payload = match decompress_if_gzip(&frame) {
                        Ok(p) => p,
                        Err(e) => {
                            return Some((
                                Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
                                rx,
                            ))
                        }
                    };
                    counter.fetch_add(payload.len() as u64, Ordering::Relaxed);
                    Some((Ok(payload), rx))
                }
                // HttpRequestEnd (or an abort) terminates the body
                _ => None,
            }
        }
    });

    execute(
        &state,
        request_id,
        head,
        reqwest::Body::wrap_stream(stream),
        &frame_tx,
    )
    .await;

    state
        .metrics
        .record_transfer(received.load(Ordering::Relaxed), 0);
    state.metrics.stream_finished();
}

async fn execute(
    state: &Arc<AppState>,
    request_id: u64,
    head: RequestHead,
    body: reqwest::Body,
    frame_tx: &FrameSender,
) {
    let settings = state.settings.load();
    let url = format!("http://127.0.0.1:{}{}", settings.target_port, head.path);
    let method: reqwest::Method = head.method.parse().unwrap_or(reqwest::Method::GET);

    let mut req = state.http.request(method, &url);
    for (name, value) in &head.headers {
        if is_skipped_header(name) {
            continue;
        }
        req = req.header(name.as_str(), value.as_str());
    }
    if let Some(host) = head.header("host") {
        req = req.header("X-Forwarded-Host", host);
    }
    if let Some(ip) = &head.client_ip {
        req = req.header("X-Forwarded-For", ip.as_str());
    }
    req = req
        .body(body)
        .timeout(Duration::from_secs(state.config.request_timeout_secs));

    let response = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            let msg = if e.is_timeout() {
                "local service timeout".to_string()
            } else if e.is_connect() {
                format!("local service unreachable: {e}")
            } else {
                format!("local service error: {e}")
            };
            warn!(request_id, error = %msg, "forward failed");
            send_error(frame_tx, request_id, &msg).await;
            return;
        }
    };

    let status = response.status().as_u16();
    let mut headers: Vec<(String, String)> = Vec::new();
    for (name, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers.push((name.as_str().to_string(), v.to_string()));
        }
    }
    let resp_head = ResponseHead { status, headers };

    let chunked = chunker::should_chunk(
        &head.path,
        response.content_length(),
        settings.chunk_threshold,
    );

    if chunked {
        stream_response(state, request_id, resp_head, response, frame_tx).await;
    } else {
        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                send_error(frame_tx, request_id, &format!("body read error: {e}")).await;
                return;
            }
        };
        // a mislabeled large body still goes down the chunked path
        if body.len() as u64 > settings.chunk_threshold {
            send_chunked_from_memory(state, request_id, resp_head, body, frame_tx).await;
            return;
        }
        state.metrics.record_transfer(0, body.len() as u64);
        match Frame::http(
            request_id,
            MsgType::HttpResponse,
            flags::END_STREAM,
            Some(&resp_head),
            &body,
        ) {
            Ok(frame) => {
                let _ = frame_tx.send(frame).await;
            }
            Err(e) => {
                send_error(frame_tx, request_id, &format!("encode error: {e}")).await;
            }
        }
        debug!(request_id, status, "request completed");
    }
}

/// Stream a response body as ordered chunk frames.
async fn stream_response(
    state: &Arc<AppState>,
    request_id: u64,
    resp_head: ResponseHead,
    response: reqwest::Response,
    frame_tx: &FrameSender,
) {
    let status = resp_head.status;
    let opening = match Frame::http(
        request_id,
        MsgType::HttpResponse,
        flags::CHUNKED,
        Some(&resp_head),
        &[],
    ) {
        Ok(f) => f,
        Err(e) => {
            send_error(frame_tx, request_id, &format!("encode error: {e}")).await;
            return;
        }
    };
    if frame_tx.send(opening).await.is_err() {
        return;
    }

    let mut sent: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk_result) = stream.next().await {
        let chunk = match chunk_result {
            Ok(c) => c,
            Err(e) => {
                warn!(request_id, error = %e, "local body read error mid-stream");
                send_error(frame_tx, request_id, &format!("body read error: {e}")).await;
                return;
            }
        };
        sent += chunk.len() as u64;
        for piece in chunker::split_chunks(&chunk, CHUNK_SIZE) {
            let frame = Frame::new(request_id, MsgType::HttpResponse, flags::CHUNKED, piece);
            if frame_tx.send(frame).await.is_err() {
                return;
            }
        }
    }

    let final_frame = Frame::new(
        request_id,
        MsgType::HttpResponse,
        flags::CHUNKED | flags::END_STREAM,
        Bytes::new(),
    );
    let _ = frame_tx.send(final_frame).await;
    state.metrics.record_transfer(0, sent);
    debug!(request_id, status, sent, "chunked response completed");
}

/// Chunk an already-buffered body (content-length lied about its size).
async fn send_chunked_from_memory(
    state: &Arc<AppState>,
    request_id: u64,
    resp_head: ResponseHead,
    body: Bytes,
    frame_tx: &FrameSender,
) {
    let opening = match Frame::http(
        request_id,
        MsgType::HttpResponse,
        flags::CHUNKED,
        Some(&resp_head),
        &[],
    ) {
        Ok(f) => f,
        Err(e) => {
            send_error(frame_tx, request_id, &format!("encode error: {e}")).await;
            return;
        }
    };
    if frame_tx.send(opening).await.is_err() {
        return;
    }
    for piece in chunker::split_chunks(&body, CHUNK_SIZE) {
        let frame = Frame::new(request_id, MsgType::HttpResponse, flags::CHUNKED, piece);
        if frame_tx.send(frame).await.is_err() {
            return;
        }
    }
    let _ = frame_tx
        .send(Frame::new(
            request_id,
            MsgType::HttpResponse,
            flags::CHUNKED | flags::END_STREAM,
            Bytes::new(),
        ))
        .await;
    state.metrics.record_transfer(0, body.len() as u64);
}

async fn send_error(frame_tx: &FrameSender, request_id: u64, message: &str) {
    let payload = ErrorPayload::new(ErrorCode::Upstream, message, true)
        .to_payload()
        .unwrap_or_default();
    let _ = frame_tx
        .send(Frame::new(request_id, MsgType::Error, 0, payload))
        .await;
}

/// Headers the forwarder manages itself on the local hop.
fn is_skipped_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("keep-alive")
}
