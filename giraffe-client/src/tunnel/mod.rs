pub mod chunker;
pub mod client;
pub mod dispatcher;
pub mod forwarder;
pub mod monitor;
pub mod raw;
pub mod writer;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::state::AppState;

/// First reconnect delay.
const INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Reconnect delay ceiling.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Run the tunnel main loop (connect, dispatch, reconnect).
pub async fn run(state: &Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    info!(
        server = %state.config.server_host,
        port = state.config.server_port,
        "starting tunnel"
    );

    let mut delay = INITIAL_DELAY;
    loop {
        match client::connect_and_run(state, &mut shutdown).await {
            Ok(client::TunnelOutcome::Shutdown) => {
                info!("tunnel shut down gracefully");
                return;
            }
            Ok(client::TunnelOutcome::Disconnected) => {
                info!("tunnel disconnected, will reconnect");
                delay = INITIAL_DELAY;
            }
            Err(e) => {
                error!(error = %e, "tunnel connection lost");
                delay = next_delay(delay);
            }
        }

        if state.is_stopping() || *shutdown.borrow() {
            info!("stopping, not reconnecting");
            return;
        }

        info!(delay_ms = delay.as_millis() as u64, "reconnecting tunnel");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                info!("shutdown requested during reconnect wait");
                return;
            }
        }
        if state.is_stopping() {
            return;
        }
    }
}

/// Exponential backoff: delay × 1.5, capped.
fn next_delay(delay: Duration) -> Duration {
    delay.mul_f64(1.5).min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_progression() {
        let mut delay = INITIAL_DELAY;
        let mut seen = Vec::new();
        for _ in 0..12 {
            seen.push(delay);
            delay = next_delay(delay);
        }
        assert_eq!(seen[0], Duration::from_secs(1));
        assert_eq!(seen[1], Duration::from_millis(1500));
        assert_eq!(seen[2], Duration::from_millis(2250));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delay, MAX_DELAY);
    }

    #[test]
    fn test_backoff_capped() {
        assert_eq!(next_delay(Duration::from_secs(29)), MAX_DELAY);
        assert_eq!(next_delay(MAX_DELAY), MAX_DELAY);
    }
}
