//! Shared edge state passed to all subsystems.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use giraffe_wire::FrameCodec;
use tokio_rustls::TlsAcceptor;

use crate::auth::Authenticator;
use crate::buffers::BufferPool;
use crate::config::EdgeConfig;
use crate::limits::{DomainRateLimiter, QuotaChecker, UsageRecorder};
use crate::raw::pool::RawPoolMap;
use crate::raw::upgrade::PendingUpgrades;
use crate::routes::RoutePublisher;
use crate::session::SessionMap;

/// Central edge state shared across the ingress router and both tunnel
/// servers. The router holds everything through this struct, so neither
/// transport needs a handle back into the router.
pub struct EdgeState {
    pub config: Arc<EdgeConfig>,
    pub codec: FrameCodec,
    pub sessions: SessionMap,
    pub pools: RawPoolMap,
    pub upgrades: PendingUpgrades,
    pub auth: Authenticator,
    pub publisher: RoutePublisher,
    pub rate: DomainRateLimiter,
    pub quota: Arc<dyn QuotaChecker>,
    pub usage: Arc<dyn UsageRecorder>,
    pub buffers: BufferPool,
    pub metrics: EdgeMetrics,
    pub rpc_acceptor: TlsAcceptor,
    pub raw_acceptor: TlsAcceptor,
}

impl EdgeState {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    pub fn upgrade_wait(&self) -> Duration {
        Duration::from_secs(self.config.upgrade_wait_secs)
    }
}

/// Aggregate counters reported in logs and session summaries.
#[derive(Default)]
pub struct EdgeMetrics {
    pub total_requests: AtomicU64,
    pub total_upgrades: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub rate_limited: AtomicU64,
    pub quota_blocked: AtomicU64,
}

impl EdgeMetrics {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upgrade(&self) {
        self.total_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transfer(&self, bytes_in: u64, bytes_out: u64) {
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }
}
