//! Dedicated WebSocket writer task.
//!
//! All frame writes go through an mpsc channel to a single writer task,
//! avoiding contention on the WebSocket sink. The writer also emits
//! keep-alive pings on its own cadence.

use std::time::Duration;

use futures_util::SinkExt;
use giraffe_wire::{Frame, FrameCodec};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};

/// Sender half, cloned by stream handlers and the monitor.
pub type FrameSender = mpsc::Sender<Frame>;

/// Spawn the writer task. Returns the sender and a JoinHandle for cleanup.
pub fn spawn_writer<S>(
    mut sink: S,
    codec: FrameCodec,
    ping_interval: Duration,
) -> (FrameSender, JoinHandle<()>)
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Frame>(256);

    let handle = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await;
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let data = match codec.encode(&frame) {
                        Ok(d) => d,
                        Err(e) => {
                            error!(error = %e, "frame exceeds cap, dropped");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Binary(data.into())).await {
                        error!(error = %e, "failed to write frame to tunnel");
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
        debug!("writer task exiting");
        let _ = sink.close().await;
    });

    (tx, handle)
}
