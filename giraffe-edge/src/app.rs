//! Edge lifecycle: initialization, task orchestration, and shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use giraffe_wire::FrameCodec;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::{Authenticator, HttpTunnelStore};
use crate::buffers::BufferPool;
use crate::config::EdgeConfig;
use crate::limits::{ApiQuotaClient, DomainRateLimiter};
use crate::raw::pool::RawPoolMap;
use crate::raw::upgrade::PendingUpgrades;
use crate::routes::RoutePublisher;
use crate::session::SessionMap;
use crate::state::{EdgeMetrics, EdgeState};
use crate::{raw, router, rpc, tls};

/// API call timeout for store, quota, and usage lookups.
const API_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(config: EdgeConfig) -> anyhow::Result<()> {
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        ingress_port = config.ingress_port,
        rpc_port = config.rpc_port,
        raw_port = config.raw_port,
        "giraffe-edge starting"
    );

    let cert_path = Path::new(&config.tls_cert);
    let key_path = Path::new(&config.tls_key);
    if config.dev_tls {
        tls::ensure_self_signed_cert(cert_path, key_path)?;
    }
    let ca_path = if config.dev_tls && !Path::new(&config.client_ca).exists() {
        // dev mode: trust the edge's own cert as the client CA
        cert_path
    } else {
        Path::new(&config.client_ca)
    };

    let rpc_acceptor = tls::build_rpc_acceptor(cert_path, key_path, ca_path)?;
    let raw_acceptor = tls::build_raw_acceptor(cert_path, key_path)?;
    match tls::cert_sha256_fingerprint(cert_path) {
        Ok(fp) => info!(fingerprint = %fp, "edge certificate loaded"),
        Err(e) => warn!(error = %e, "could not fingerprint edge certificate"),
    }

    let store = Arc::new(HttpTunnelStore::new(
        &config.api_url,
        &config.api_token,
        API_TIMEOUT,
    ));
    let quota_client = ApiQuotaClient::new(&config.api_url, &config.api_token, API_TIMEOUT);

    let config = Arc::new(config);
    let state = Arc::new(EdgeState {
        codec: FrameCodec::new(config.codec_frame_cap()),
        sessions: SessionMap::new(),
        pools: RawPoolMap::new(
            Duration::from_secs(config.raw_max_age_secs),
            config.raw_max_requests,
        ),
        upgrades: PendingUpgrades::new(),
        auth: Authenticator::new(store),
        publisher: RoutePublisher::new(&config.proxy_admin_url, &config.proxy_server),
        rate: DomainRateLimiter::new(config.rate_limit_per_min, config.rate_burst),
        quota: quota_client.clone(),
        usage: quota_client,
        buffers: BufferPool::default(),
        metrics: EdgeMetrics::default(),
        rpc_acceptor,
        raw_acceptor,
        config,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles: Vec<(&str, JoinHandle<anyhow::Result<()>>)> = Vec::new();
    {
        let s = Arc::clone(&state);
        let rx = shutdown_rx.clone();
        handles.push(("ingress", tokio::spawn(router::ingress::run(s, rx))));
    }
    {
        let s = Arc::clone(&state);
        let rx = shutdown_rx.clone();
        handles.push(("rpc", tokio::spawn(rpc::server::run(s, rx))));
    }
    {
        let s = Arc::clone(&state);
        let rx = shutdown_rx.clone();
        handles.push(("raw", tokio::spawn(raw::server::run(s, rx))));
    }
    {
        let s = Arc::clone(&state);
        let rx = shutdown_rx.clone();
        handles.push((
            "sweeper",
            tokio::spawn(async move {
                sweeper(s, rx).await;
                Ok(())
            }),
        ));
    }

    wait_for_shutdown().await;
    info!("shutdown signal received, draining...");
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(state.config.shutdown_grace_secs);
    let drain = async {
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "task ended with error"),
                Err(e) => warn!(task = name, error = %e, "task join failed"),
            }
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!(grace_secs = grace.as_secs(), "graceful drain timed out, hard stop");
    }

    info!("giraffe-edge stopped");
    Ok(())
}

/// Periodically probe raw pools and drop dead connections.
async fn sweeper(state: Arc<EdgeState>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(state.config.sweep_interval_secs);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                for pool in state.pools.all() {
                    let removed = pool.sweep().await;
                    if removed > 0 {
                        info!(domain = %pool.domain(), removed, "swept dead raw connections");
                    }
                }
            }
            _ = shutdown.changed() => return,
        }
    }
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
pub fn build_test_state() -> Arc<EdgeState> {
    use crate::auth::MemoryTunnelStore;
    use crate::limits::{AllowAllQuota, NoopUsage};
    use clap::Parser;

    let _ = rustls::crypto::ring::default_provider().install_default();

    let dir = std::env::temp_dir().join(format!("giraffe-edge-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let cert = dir.join("cert.pem");
    let key = dir.join("key.pem");
    tls::ensure_self_signed_cert(&cert, &key).unwrap();

    let config = Arc::new(EdgeConfig::parse_from(["giraffe-edge"]));
    Arc::new(EdgeState {
        codec: FrameCodec::new(config.codec_frame_cap()),
        sessions: SessionMap::new(),
        pools: RawPoolMap::new(
            Duration::from_secs(config.raw_max_age_secs),
            config.raw_max_requests,
        ),
        upgrades: PendingUpgrades::new(),
        auth: Authenticator::new(Arc::new(MemoryTunnelStore::default())),
        publisher: RoutePublisher::new(&config.proxy_admin_url, &config.proxy_server),
        rate: DomainRateLimiter::new(config.rate_limit_per_min, config.rate_burst),
        quota: Arc::new(AllowAllQuota),
        usage: Arc::new(NoopUsage),
        buffers: BufferPool::default(),
        metrics: EdgeMetrics::default(),
        rpc_acceptor: tls::build_rpc_acceptor(&cert, &key, &cert).unwrap(),
        raw_acceptor: tls::build_raw_acceptor(&cert, &key).unwrap(),
        config,
    })
}
