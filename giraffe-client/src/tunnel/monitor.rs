//! Monitor loop: reports client metrics over the tunnel.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use giraffe_wire::{ControlMessage, Frame, MsgType};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::state::AppState;

use super::writer::FrameSender;

/// Cadence of Metrics frames.
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

pub fn spawn(
    state: Arc<AppState>,
    frame_tx: FrameSender,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REPORT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let metrics = &state.metrics;
                    let msg = ControlMessage::Metrics {
                        active_streams: metrics.active_streams.load(Ordering::Relaxed),
                        total_requests: metrics.total_requests.load(Ordering::Relaxed),
                        bytes_in: metrics.bytes_in.load(Ordering::Relaxed),
                        bytes_out: metrics.bytes_out.load(Ordering::Relaxed),
                        reconnects: metrics.reconnects.load(Ordering::Relaxed),
                    };
                    let Ok(payload) = msg.to_payload() else { continue };
                    if frame_tx
                        .send(Frame::control(MsgType::Control, payload))
                        .await
                        .is_err()
                    {
                        break; // writer closed
                    }
                    debug!("metrics reported");
                }
                _ = shutdown.changed() => {
                    debug!("monitor task shutting down");
                    break;
                }
            }
        }
    })
}
