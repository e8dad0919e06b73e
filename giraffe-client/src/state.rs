//! Shared client state passed to all tunnel subsystems.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use giraffe_wire::FrameCodec;

use crate::config::ClientConfig;

/// Settings the edge may adjust at runtime via `Control::Config` frames.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub target_port: u16,
    pub chunk_threshold: u64,
}

/// Central client state shared by the tunnel, forwarder, and supervisor.
pub struct AppState {
    pub config: Arc<ClientConfig>,
    pub codec: FrameCodec,
    /// HTTP client for the local service (shared, pooled).
    pub http: reqwest::Client,
    /// TLS config for edge connections; resumption disabled so every
    /// reconnect performs a fresh handshake.
    pub tls: Arc<rustls::ClientConfig>,
    /// Set by the supervisor; suppresses reconnect attempts.
    stopping: AtomicBool,
    pub settings: ArcSwap<RuntimeSettings>,
    pub metrics: ClientMetrics,
    /// Last Status frame seen from the edge, for diagnostics.
    pub last_status: std::sync::Mutex<Option<giraffe_wire::ControlMessage>>,
}

impl AppState {
    pub fn new(config: Arc<ClientConfig>, tls: Arc<rustls::ClientConfig>) -> Self {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .tcp_nodelay(true)
            .build()
            .expect("failed to build local HTTP client");

        let settings = RuntimeSettings {
            target_port: config.local_port,
            chunk_threshold: config.chunk_threshold,
        };

        Self {
            codec: FrameCodec::new(config.max_frame_bytes + 128 * 1024),
            http,
            tls,
            stopping: AtomicBool::new(false),
            settings: ArcSwap::from_pointee(settings),
            metrics: ClientMetrics::default(),
            last_status: std::sync::Mutex::new(None),
            config,
        }
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Apply a Config frame from the edge without reconnecting.
    pub fn apply_remote_settings(&self, target_port: Option<u16>, chunk_threshold: Option<u64>) {
        let current = self.settings.load();
        let updated = RuntimeSettings {
            target_port: target_port.unwrap_or(current.target_port),
            chunk_threshold: chunk_threshold.unwrap_or(current.chunk_threshold),
        };
        self.settings.store(Arc::new(updated));
    }
}

/// Counters reported to the edge on the monitor cadence.
#[derive(Default)]
pub struct ClientMetrics {
    pub active_streams: AtomicU64,
    pub total_requests: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub reconnects: AtomicU64,
}

impl ClientMetrics {
    pub fn stream_started(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_finished(&self) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_transfer(&self, bytes_in: u64, bytes_out: u64) {
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientArgs;

    fn test_state() -> AppState {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let home = std::env::temp_dir().join(format!("giraffecloud-state-{}", std::process::id()));
        std::fs::create_dir_all(&home).unwrap();
        crate::config::ConfigFile {
            token: Some("tok".into()),
            local_port: Some(8080),
            ..Default::default()
        }
        .save(&home.join("config.json"))
        .unwrap();
        let args = ClientArgs {
            home: Some(home),
            log_level: "info".into(),
            ..Default::default()
        };
        let config = Arc::new(ClientConfig::resolve(&args).unwrap());
        let tls = Arc::new(crate::tls::build_client_tls(&config).unwrap());
        AppState::new(config, tls)
    }

    #[test]
    fn test_remote_settings_partial_update() {
        let state = test_state();
        assert_eq!(state.settings.load().target_port, 8080);
        state.apply_remote_settings(Some(9090), None);
        let s = state.settings.load();
        assert_eq!(s.target_port, 9090);
        assert_eq!(s.chunk_threshold, 16 * 1024 * 1024);
    }

    #[test]
    fn test_stopping_flag() {
        let state = test_state();
        assert!(!state.is_stopping());
        state.stop();
        assert!(state.is_stopping());
    }
}
