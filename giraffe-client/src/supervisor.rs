//! Client supervisor: single-instance lock, signal handling, and tunnel
//! task reconciliation.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ClientArgs, ClientConfig};
use crate::lock::{LockError, PidLock};
use crate::state::AppState;
use crate::{tls, tunnel};

pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_LOCK: i32 = 3;
pub const EXIT_TLS: i32 = 4;

/// How often the supervisor reconciles the expected tunnel against the
/// live task.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Run the agent to completion. Returns the process exit code.
pub async fn run(args: ClientArgs) -> i32 {
    let config = match ClientConfig::resolve(&args) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration invalid");
            return EXIT_CONFIG;
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "configuration invalid");
        return EXIT_CONFIG;
    }

    let tls_config = match tls::build_client_tls(&config) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!(error = %e, "TLS configuration failed");
            return EXIT_TLS;
        }
    };

    // One tunnel process per home directory; duplicates exit before ever
    // contacting the edge.
    let pid_lock = match PidLock::acquire(&config.home) {
        Ok(l) => l,
        Err(e @ LockError::Contended { .. }) => {
            error!(error = %e, "another instance is running");
            return EXIT_LOCK;
        }
        Err(e) => {
            error!(error = %e, "could not acquire pid lock");
            return EXIT_LOCK;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        home = %config.home.display(),
        domain = config.domain.as_deref().unwrap_or("<auto>"),
        local_port = config.local_port,
        "giraffe-client starting"
    );

    let state = Arc::new(AppState::new(Arc::new(config), tls_config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tunnel_handle = spawn_tunnel(&state, &shutdown_rx);
    let mut reconcile = tokio::time::interval(RECONCILE_INTERVAL);
    reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    reconcile.tick().await;

    let mut signals = Box::pin(wait_for_shutdown());
    loop {
        tokio::select! {
            _ = &mut signals => break,
            _ = reconcile.tick() => {
                // the tunnel loop only exits on shutdown; an exited task
                // while running means something went badly wrong, so the
                // supervisor restores the expected state
                if tunnel_handle.is_finished() && !state.is_stopping() {
                    warn!("tunnel task exited unexpectedly, restarting");
                    tunnel_handle = spawn_tunnel(&state, &shutdown_rx);
                }
            }
        }
    }

    info!("shutdown signal received, stopping tunnel");
    state.stop();
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(Duration::from_secs(35), &mut tunnel_handle)
        .await
        .is_err()
    {
        warn!("tunnel task did not stop in time, aborting");
        tunnel_handle.abort();
    }

    pid_lock.release();
    info!("giraffe-client stopped");
    EXIT_OK
}

fn spawn_tunnel(state: &Arc<AppState>, shutdown_rx: &watch::Receiver<bool>) -> JoinHandle<()> {
    let state = Arc::clone(state);
    let rx = shutdown_rx.clone();
    tokio::spawn(async move {
        tunnel::run(&state, rx).await;
    })
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [EXIT_OK, EXIT_CONFIG, EXIT_LOCK, EXIT_TLS];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[tokio::test]
    async fn test_config_error_exit_code() {
        // empty home with no config file: missing token
        let home = std::env::temp_dir().join(format!(
            "giraffecloud-supervisor-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&home).unwrap();
        let args = ClientArgs {
            home: Some(home),
            log_level: "info".into(),
            ..Default::default()
        };
        assert_eq!(run(args).await, EXIT_CONFIG);
    }
}
